use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::EnvVar;

/// Predicates tested against each finding. A rule matches when any entry
/// matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct RuleMatches {
    #[serde(default)]
    pub any_of: Vec<Value>,
}

/// Follow-up job template. The scan type and parameters may reference
/// finding fields as `{{path.to.field}}`. `env` is passed through as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ScanTemplate {
    pub scan_type: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct CascadingRuleSpec {
    pub matches: RuleMatches,
    pub scan_spec: ScanTemplate,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scan_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scan_annotations: BTreeMap<String, String>,
}

/// A named rule mapping matching findings to follow-up jobs. The name is
/// what gets recorded in a [`CascadeChain`](crate::CascadeChain).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadingRule {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub spec: CascadingRuleSpec,
}

impl CascadingRule {
    pub fn new(
        name: impl Into<String>,
        scan_type: impl Into<String>,
        parameters: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            spec: CascadingRuleSpec {
                scan_spec: ScanTemplate {
                    scan_type: scan_type.into(),
                    parameters: parameters.into_iter().map(Into::into).collect(),
                    env: Vec::new(),
                },
                ..CascadingRuleSpec::default()
            },
        }
    }

    pub fn matching(mut self, predicate: Value) -> Self {
        self.spec.matches.any_of.push(predicate);
        self
    }

    pub fn with_env(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.spec.scan_spec.env.push(EnvVar::new(name, value));
        self
    }

    pub fn with_label(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_rule_document() {
        let rule: CascadingRule = serde_json::from_value(json!({
            "name": "tls-scans",
            "labels": { "kennel.io/intensive": "light" },
            "spec": {
                "matches": { "anyOf": [
                    { "category": "Open Port", "attributes": { "service": "https*" } }
                ]},
                "scanSpec": {
                    "scanType": "sslyze",
                    "parameters": ["--regular", "{{$.hostOrIP}}:{{attributes.port}}"]
                },
                "scanLabels": { "origin": "{{name}}" }
            }
        }))
        .unwrap();
        assert_eq!(rule.spec.scan_spec.scan_type, "sslyze");
        assert_eq!(rule.spec.matches.any_of.len(), 1);
        assert!(rule.spec.scan_annotations.is_empty());
    }
}
