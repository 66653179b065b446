//! Data model shared across kennel crates.
#![allow(missing_docs)]

pub mod chain;
pub mod error;
pub mod finding;
pub mod ids;
pub mod job;
pub mod rule;
pub mod selector;
pub mod wire;

pub use chain::{CHAIN_ANNOTATION, CascadeChain};
pub use error::{ModelError, Result as ModelResult};
pub use finding::{Finding, FindingsSummary, Severity, SeverityCounts};
pub use ids::JobId;
pub use job::{
    CascadeSpec, DEFAULT_TENANT, EnvVar, Job, JobMetadata, JobState,
    JobSubmission, OwnerReference, PARSE_PREFIX, UploadedFile, parse_job_type,
    resource_name,
};
pub use rule::{CascadingRule, CascadingRuleSpec, RuleMatches, ScanTemplate};
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorOperator};
