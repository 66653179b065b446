use std::{fmt, path::Path};

use async_trait::async_trait;
use kennel_model::{CascadingRule, LabelSelector};
use tracing::info;

use crate::error::{Result, ScanError};

/// Supplies the cascading rules whose labels match a job's selector.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn rules(&self, selector: &LabelSelector) -> Result<Vec<CascadingRule>>;
}

/// A fixed rule set, loaded once.
#[derive(Clone, Default)]
pub struct StaticRules {
    rules: Vec<CascadingRule>,
}

impl fmt::Debug for StaticRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticRules")
            .field("rules", &self.rules.iter().map(|r| &r.name).collect::<Vec<_>>())
            .finish()
    }
}

impl StaticRules {
    pub fn new(rules: Vec<CascadingRule>) -> Self {
        Self { rules }
    }

    /// Reads a JSON array of rules.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let rules: Vec<CascadingRule> = serde_json::from_str(&raw)?;
        if let Some(dup) = duplicate_name(&rules) {
            return Err(ScanError::InvalidJob(format!(
                "cascading rule '{dup}' is defined twice in {}",
                path.display()
            )));
        }
        info!(path = %path.display(), count = rules.len(), "loaded cascading rules");
        Ok(Self::new(rules))
    }
}

fn duplicate_name(rules: &[CascadingRule]) -> Option<&str> {
    rules.iter().enumerate().find_map(|(i, rule)| {
        rules[..i]
            .iter()
            .any(|earlier| earlier.name == rule.name)
            .then_some(rule.name.as_str())
    })
}

#[async_trait]
impl RuleSource for StaticRules {
    async fn rules(&self, selector: &LabelSelector) -> Result<Vec<CascadingRule>> {
        Ok(self
            .rules
            .iter()
            .filter(|rule| selector.matches(&rule.labels))
            .cloned()
            .collect())
    }
}

/// Cascading disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRules;

#[async_trait]
impl RuleSource for NoRules {
    async fn rules(&self, _selector: &LabelSelector) -> Result<Vec<CascadingRule>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use kennel_model::SelectorOperator;
    use serde_json::json;

    use super::*;

    fn rules() -> StaticRules {
        StaticRules::new(vec![
            CascadingRule::new("tls", "sslyze", ["{{$.hostOrIP}}"])
                .with_label("kennel.io/intensive", "light"),
            CascadingRule::new("brute", "ncrack", ["{{$.hostOrIP}}"])
                .with_label("kennel.io/intensive", "high")
                .with_label("kennel.io/invasive", "invasive"),
        ])
    }

    #[tokio::test]
    async fn filters_by_selector() {
        let light = LabelSelector::default().with_label("kennel.io/intensive", "light");
        let names: Vec<_> = rules()
            .rules(&light)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["tls"]);

        let non_invasive = LabelSelector::default().with_expression(
            "kennel.io/invasive",
            SelectorOperator::DoesNotExist,
            Vec::<String>::new(),
        );
        assert_eq!(rules().rules(&non_invasive).await.unwrap().len(), 1);
        assert_eq!(rules().rules(&LabelSelector::default()).await.unwrap().len(), 2);
    }

    #[test]
    fn loads_rules_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            json!([{
                "name": "tls",
                "labels": { "kennel.io/intensive": "light" },
                "spec": {
                    "matches": { "anyOf": [{ "category": "Open Port" }] },
                    "scanSpec": { "scanType": "sslyze", "parameters": ["{{$.hostOrIP}}"] }
                }
            }])
        )
        .unwrap();
        let rules = StaticRules::from_json_file(file.path()).unwrap();
        assert_eq!(rules.rules.len(), 1);
    }

    #[test]
    fn rejects_duplicate_rule_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let rule = json!({
            "name": "tls",
            "spec": {
                "matches": { "anyOf": [] },
                "scanSpec": { "scanType": "sslyze" }
            }
        });
        write!(file, "{}", json!([rule.clone(), rule])).unwrap();
        assert!(StaticRules::from_json_file(file.path()).is_err());
    }
}
