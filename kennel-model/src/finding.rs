use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;

/// Severity of a finding. Ordered `Informational < Low < Medium < High`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Informational,
    Low,
    Medium,
    High,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Informational => "INFORMATIONAL",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFORMATIONAL" => Ok(Severity::Informational),
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            other => Err(ModelError::InvalidArgument(format!(
                "unknown severity {other}"
            ))),
        }
    }
}

/// A normalized observation produced by a parser.
///
/// Fields outside the shared schema are preserved in `extra` so a finding
/// survives a serialize/deserialize cycle unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osi_layer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Finding {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            severity,
            ..Self::default()
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// String attribute lookup, `None` for missing or non-string values.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// `attributes.hostname`, falling back to `attributes.ip_address`.
    pub fn host_or_ip(&self) -> Option<&str> {
        self.attribute_str("hostname")
            .filter(|h| !h.is_empty())
            .or_else(|| self.attribute_str("ip_address"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub informational: u64,
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

impl SeverityCounts {
    fn bump(&mut self, severity: Severity) {
        match severity {
            Severity::Informational => self.informational += 1,
            Severity::Low => self.low += 1,
            Severity::Medium => self.medium += 1,
            Severity::High => self.high += 1,
        }
    }
}

/// Aggregate stored under a job's `status.findings`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingsSummary {
    pub count: u64,
    pub finding_severities: SeverityCounts,
    pub finding_categories: BTreeMap<String, u64>,
}

impl FindingsSummary {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut summary = Self::default();
        for finding in findings {
            summary.count += 1;
            summary.finding_severities.bump(finding.severity);
            *summary
                .finding_categories
                .entry(finding.category.clone())
                .or_default() += 1;
        }
        summary
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        let counts = &self.finding_severities;
        [
            (Severity::High, counts.high),
            (Severity::Medium, counts.medium),
            (Severity::Low, counts.low),
            (Severity::Informational, counts.informational),
        ]
        .into_iter()
        .find(|(_, n)| *n > 0)
        .map(|(s, _)| s)
    }
}
