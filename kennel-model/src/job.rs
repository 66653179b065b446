use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    chain::CascadeChain,
    error::ModelError,
    finding::FindingsSummary,
    ids::JobId,
    selector::LabelSelector,
};

/// Tenant used when a caller does not name one.
pub const DEFAULT_TENANT: &str = "default";

/// Prefix of the pseudo job types that route raw results to a parser.
pub const PARSE_PREFIX: &str = "parse:";

/// `parse:<resultType>`
pub fn parse_job_type(result_type: &str) -> String {
    format!("{PARSE_PREFIX}{result_type}")
}

/// Lifecycle of a job. Transitions only move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum JobState {
    Queued,
    Locked,
    Running,
    Completed,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Locked => "Locked",
            JobState::Running => "Running",
            JobState::Completed => "Completed",
        }
    }

    /// Whether `self -> next` is a legal move. `Running` and `Completed`
    /// may be re-entered so that repeated reports overwrite in place.
    /// `Locked -> Completed` is legal because a sidecar can report before
    /// the dispatcher records the workload.
    pub const fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Locked)
                | (JobState::Locked, JobState::Running)
                | (JobState::Locked, JobState::Completed)
                | (JobState::Running, JobState::Running)
                | (JobState::Running, JobState::Completed)
                | (JobState::Completed, JobState::Completed)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(JobState::Queued),
            "Locked" => Ok(JobState::Locked),
            "Running" => Ok(JobState::Running),
            "Completed" => Ok(JobState::Completed),
            other => Err(ModelError::InvalidState(other.to_string())),
        }
    }
}

/// Points a cascaded or parse job at the job that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: JobId,
}

impl OwnerReference {
    pub fn scan(job: &Job) -> Self {
        Self {
            kind: "Scan".to_string(),
            name: job.metadata.name.clone(),
            uid: job.id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    #[serde(default)]
    pub name: String,
    /// When `name` is blank, the name becomes this prefix plus a random
    /// suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerReference>,
}

fn default_true() -> bool {
    true
}

/// A plain environment variable for a scanner's primary container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Which cascading rules apply to a job's findings, and what follow-up jobs
/// inherit from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct CascadeSpec {
    #[serde(flatten)]
    pub selector: LabelSelector,
    #[serde(default = "default_true")]
    pub inherit_labels: bool,
    #[serde(default = "default_true")]
    pub inherit_annotations: bool,
    /// Follow-up jobs start with the parent's environment. Variables added
    /// by the rule that produced the parent are not passed on.
    #[serde(default)]
    pub inherit_env: bool,
}

impl Default for CascadeSpec {
    fn default() -> Self {
        Self {
            selector: LabelSelector::default(),
            inherit_labels: true,
            inherit_annotations: true,
            inherit_env: false,
        }
    }
}

impl From<LabelSelector> for CascadeSpec {
    fn from(selector: LabelSelector) -> Self {
        Self {
            selector,
            ..Self::default()
        }
    }
}

/// A result file the sidecar uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub file_name: String,
    pub upload_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
}

/// Everything a caller supplies when submitting work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    pub job_type: String,
    pub tenant: String,
    pub parameters: Vec<String>,
    pub metadata: JobMetadata,
    pub cascades: Option<CascadeSpec>,
    /// Extra environment for the primary scanner container.
    pub env: Vec<EnvVar>,
}

impl JobSubmission {
    pub fn new(
        job_type: impl Into<String>,
        tenant: impl Into<String>,
        parameters: Vec<String>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            tenant: tenant.into(),
            parameters,
            metadata: JobMetadata::default(),
            cascades: None,
            env: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_cascades(mut self, cascades: Option<CascadeSpec>) -> Self {
        self.cascades = cascades;
        self
    }

    pub fn with_env(mut self, env: Vec<EnvVar>) -> Self {
        self.env = env;
        self
    }

    pub fn chain(&self) -> CascadeChain {
        CascadeChain::from_annotations(&self.metadata.annotations)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub tenant: String,
    pub parameters: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
    pub metadata: JobMetadata,
    #[serde(default)]
    pub cascades: Option<CascadeSpec>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub workload: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uploaded_files: Vec<UploadedFile>,
    /// Result files a parse job has been queued for.
    #[serde(default)]
    pub parsed_files: Vec<UploadedFile>,
    #[serde(default)]
    pub findings: Option<FindingsSummary>,
    #[serde(default)]
    pub cascade_evaluated_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materializes a queued job. A blank name becomes
    /// `<generate_name><suffix>` or, without a prefix, `<type>-<id>`.
    pub fn from_submission(submission: JobSubmission) -> Self {
        let id = JobId::new();
        let mut metadata = submission.metadata;
        if metadata.name.is_empty() {
            metadata.name = match metadata.generate_name.as_deref() {
                Some(prefix) => {
                    let simple = id.0.simple().to_string();
                    format!("{prefix}{}", &simple[simple.len() - 5..])
                }
                None => resource_name(&submission.job_type, &id),
            };
        }
        Self {
            id,
            job_type: submission.job_type,
            tenant: submission.tenant,
            parameters: submission.parameters,
            created_at: Utc::now(),
            state: JobState::Queued,
            metadata,
            cascades: submission.cascades,
            env: submission.env,
            claimed_by: None,
            locked_at: None,
            workload: None,
            completed_at: None,
            uploaded_files: Vec::new(),
            parsed_files: Vec::new(),
            findings: None,
            cascade_evaluated_at: None,
        }
    }

    pub fn chain(&self) -> CascadeChain {
        CascadeChain::from_annotations(&self.metadata.annotations)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Whether a parse job was already queued for this result file.
    pub fn has_parse_job(&self, file: &UploadedFile) -> bool {
        self.parsed_files.iter().any(|parsed| {
            parsed.file_name == file.file_name
                && parsed.result_type == file.result_type
        })
    }

    /// Result type handled by a `parse:<resultType>` job.
    pub fn parse_result_type(&self) -> Option<&str> {
        self.job_type.strip_prefix(PARSE_PREFIX)
    }

    /// Moves the job to `next`, rejecting backward moves.
    pub fn transition(&mut self, next: JobState) -> crate::error::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// A DNS-1123 label built from a job type and id, e.g. `parse-nmap-xml-<id>`.
pub fn resource_name(job_type: &str, id: &JobId) -> String {
    let mut prefix: String = job_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while prefix.contains("--") {
        prefix = prefix.replace("--", "-");
    }
    let prefix = prefix.trim_matches('-');
    if prefix.is_empty() {
        id.to_string()
    } else {
        format!("{prefix}-{id}")
    }
}
