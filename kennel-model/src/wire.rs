//! Request and response bodies of the engine's HTTP surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    finding::{Finding, FindingsSummary},
    ids::JobId,
    job::{
        CascadeSpec, DEFAULT_TENANT, EnvVar, Job, JobMetadata, JobState,
        JobSubmission, OwnerReference, UploadedFile,
    },
};

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub job_types: Vec<String>,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Name of the dispatcher instance claiming the job.
    #[serde(
        rename = "dispatcherEnvironmentName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub claimant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedJob {
    pub id: JobId,
    pub job_type: String,
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

impl From<&Job> for LockedJob {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.clone(),
            parameters: job.parameters.clone(),
            env: job.env.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub job_type: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascades: Option<CascadeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

impl SubmitRequest {
    pub fn new(
        job_type: impl Into<String>,
        tenant: impl Into<String>,
        parameters: Vec<String>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            tenant: tenant.into(),
            parameters,
            name: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            cascades: None,
            env: Vec::new(),
        }
    }
}

impl From<SubmitRequest> for JobSubmission {
    fn from(req: SubmitRequest) -> Self {
        JobSubmission::new(req.job_type, req.tenant, req.parameters)
            .with_metadata(JobMetadata {
                name: req.name.unwrap_or_default(),
                generate_name: None,
                labels: req.labels,
                annotations: req.annotations,
                owner: None,
            })
            .with_cascades(req.cascades)
            .with_env(req.env)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: JobId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedFileDefinition {
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    pub scan_id: JobId,
    pub requested_file_definition: RequestedFileDefinition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRequest {
    pub workload_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingsRequest {
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingsResponse {
    pub cascaded_jobs: Vec<JobId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanMetadata {
    pub name: String,
    pub uid: JobId,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSpec {
    pub scan_type: String,
    pub tenant: String,
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascades: Option<CascadeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatus {
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<UploadedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<FindingsSummary>,
}

/// A job rendered in the shape of a `Scan` cluster resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanView {
    pub metadata: ScanMetadata,
    pub spec: ScanSpec,
    pub status: ScanStatus,
}

impl From<&Job> for ScanView {
    fn from(job: &Job) -> Self {
        Self {
            metadata: ScanMetadata {
                name: job.metadata.name.clone(),
                uid: job.id,
                creation_timestamp: job.created_at,
                labels: job.metadata.labels.clone(),
                annotations: job.metadata.annotations.clone(),
                owner_references: job.metadata.owner.iter().cloned().collect(),
            },
            spec: ScanSpec {
                scan_type: job.job_type.clone(),
                tenant: job.tenant.clone(),
                parameters: job.parameters.clone(),
                cascades: job.cascades.clone(),
                env: job.env.clone(),
            },
            status: ScanStatus {
                state: job.state,
                claimed_by: job.claimed_by.clone(),
                locked_at: job.locked_at,
                workload: job.workload.clone(),
                finished_at: job.completed_at,
                files: job.uploaded_files.clone(),
                findings: job.findings.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lock_request_reads_dispatcher_name_and_defaults_tenant() {
        let req: LockRequest = serde_json::from_value(json!({
            "jobTypes": ["nmap", "parse:nmap-xml"],
            "dispatcherEnvironmentName": "cluster-a"
        }))
        .unwrap();
        assert_eq!(req.tenant, DEFAULT_TENANT);
        assert_eq!(req.claimant.as_deref(), Some("cluster-a"));
    }

    #[test]
    fn submit_request_accepts_minimal_body() {
        let req: SubmitRequest = serde_json::from_value(json!({
            "jobType": "nmap",
            "parameters": ["-Pn", "example.com"]
        }))
        .unwrap();
        let submission = JobSubmission::from(req);
        assert_eq!(submission.tenant, "default");
        assert!(submission.cascades.is_none());
        assert!(submission.metadata.name.is_empty());
    }

    #[test]
    fn submitted_env_reaches_the_locked_job() {
        let req: SubmitRequest = serde_json::from_value(json!({
            "jobType": "nikto",
            "parameters": ["-h", "example.com"],
            "env": [{ "name": "NIKTO_TUNING", "value": "x" }]
        }))
        .unwrap();
        let job = Job::from_submission(JobSubmission::from(req));
        let locked = serde_json::to_value(LockedJob::from(&job)).unwrap();
        assert_eq!(locked["env"][0]["name"], "NIKTO_TUNING");

        let bare = Job::from_submission(JobSubmission::new("nmap", "default", vec![]));
        let locked = serde_json::to_value(LockedJob::from(&bare)).unwrap();
        assert!(locked.get("env").is_none());
    }

    #[test]
    fn upload_url_request_uses_camel_case() {
        let id = JobId::new();
        let req: UploadUrlRequest = serde_json::from_value(json!({
            "scanId": id.to_string(),
            "requestedFileDefinition": { "fileName": "nmap-results.xml" }
        }))
        .unwrap();
        assert_eq!(req.scan_id, id);
        assert_eq!(req.requested_file_definition.file_name, "nmap-results.xml");
    }

    #[test]
    fn scan_view_exposes_status() {
        let job = Job::from_submission(JobSubmission::new(
            "nmap",
            "default",
            vec!["-Pn".into()],
        ));
        let view = serde_json::to_value(ScanView::from(&job)).unwrap();
        assert_eq!(view["spec"]["scanType"], "nmap");
        assert_eq!(view["status"]["state"], "Queued");
        assert_eq!(view["metadata"]["uid"], job.id.to_string());
    }
}
