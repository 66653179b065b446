//! Ordered history of cascading rules applied to a job and its ancestors.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Annotation key carrying the comma-joined chain on a job.
pub const CHAIN_ANNOTATION: &str = "cascading.kennel.io/chain";

/// Rule names applied to produce a job, oldest first.
///
/// A rule name never appears twice. The chain is the only loop guard for
/// cascading scans: it does not bound depth and it does not stop two
/// different rules from re-triggering each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CascadeChain(Vec<String>);

impl CascadeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a chain from a list of rule names, rejecting duplicates.
    pub fn from_rules<I, S>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut chain = Self::new();
        for rule in rules {
            chain = chain.extended(rule)?;
        }
        Ok(chain)
    }

    /// Reads the chain from a job's annotations. Missing or empty
    /// annotations yield an empty chain.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        annotations
            .get(CHAIN_ANNOTATION)
            .map(|raw| Self::parse(raw))
            .unwrap_or_default()
    }

    /// Parses a comma-joined chain. Empty segments are dropped and repeated
    /// names collapse onto their first occurrence.
    pub fn parse(raw: &str) -> Self {
        let mut names: Vec<String> = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() || names.iter().any(|n| n == part) {
                continue;
            }
            names.push(part.to_string());
        }
        Self(names)
    }

    pub fn contains(&self, rule: &str) -> bool {
        self.0.iter().any(|name| name == rule)
    }

    /// Returns a new chain with `rule` appended. Fails if the rule was
    /// already applied somewhere in the chain.
    pub fn extended(&self, rule: impl Into<String>) -> Result<Self> {
        let rule = rule.into();
        if self.contains(&rule) {
            return Err(ModelError::DuplicateChainEntry(rule));
        }
        let mut names = self.0.clone();
        names.push(rule);
        Ok(Self(names))
    }

    pub fn rules(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value stored under [`CHAIN_ANNOTATION`].
    pub fn to_annotation(&self) -> String {
        self.0.join(",")
    }
}

impl fmt::Display for CascadeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_annotation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extending_appends_in_order() {
        let chain = CascadeChain::new()
            .extended("nmap-hostscan")
            .and_then(|c| c.extended("https-tls-scan"))
            .expect("distinct rules extend");
        assert_eq!(chain.to_annotation(), "nmap-hostscan,https-tls-scan");
    }

    #[test]
    fn extending_with_existing_rule_fails() {
        let chain = CascadeChain::from_rules(["a", "b"]).unwrap();
        assert_eq!(
            chain.extended("a"),
            Err(ModelError::DuplicateChainEntry("a".into()))
        );
    }

    #[test]
    fn annotations_round_into_chain() {
        let mut annotations = BTreeMap::new();
        annotations.insert(CHAIN_ANNOTATION.to_string(), "a,,b, c".into());
        let chain = CascadeChain::from_annotations(&annotations);
        assert_eq!(chain.rules(), &["a", "b", "c"]);
        assert!(CascadeChain::from_annotations(&BTreeMap::new()).is_empty());
    }
}
