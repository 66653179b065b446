//! The queue/lock service: submissions, claims, result URLs, completion
//! and findings.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use kennel_config::EngineConfig;
use kennel_model::{
    Finding, FindingsSummary, Job, JobId, JobMetadata, JobSubmission,
    OwnerReference, UploadedFile, parse_job_type, wire::LockedJob,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    broker::JobBroker,
    cascade::{RuleSource, plan_cascades},
    error::{Result, ScanError},
    queue::{ClaimRequest, ParseJob, QueueService},
    storage::{ObjectStorageGateway, UrlMethod, result_key},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Enqueue `parse:<resultType>` jobs for completed result files.
    pub auto_parse: bool,
    pub default_tenant: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            auto_parse: true,
            default_tenant: kennel_model::DEFAULT_TENANT.to_string(),
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            auto_parse: cfg.auto_parse,
            default_tenant: cfg.default_tenant.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ScanJobService {
    queue: Arc<dyn QueueService>,
    storage: Arc<dyn ObjectStorageGateway>,
    rules: Arc<dyn RuleSource>,
    settings: EngineSettings,
}

impl fmt::Debug for ScanJobService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanJobService")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ScanJobService {
    pub fn new(
        queue: Arc<dyn QueueService>,
        storage: Arc<dyn ObjectStorageGateway>,
        rules: Arc<dyn RuleSource>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            queue,
            storage,
            rules,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Queues a job and returns its id without waiting for capacity.
    pub async fn submit(&self, mut submission: JobSubmission) -> Result<JobId> {
        if submission.job_type.trim().is_empty() {
            return Err(ScanError::InvalidJob(
                "job type must not be empty".into(),
            ));
        }
        if submission.tenant.trim().is_empty() {
            submission.tenant = self.settings.default_tenant.clone();
        }
        let job = Job::from_submission(submission);
        let (id, job_type, tenant) =
            (job.id, job.job_type.clone(), job.tenant.clone());
        self.queue.enqueue(job).await?;
        info!(
            job_id = %id,
            job_type = %job_type,
            tenant = %tenant,
            "job submitted"
        );
        Ok(id)
    }

    pub async fn claim_next(
        &self,
        request: &ClaimRequest,
    ) -> Result<Option<Job>> {
        let claimed = self.queue.claim_next(request).await?;
        match &claimed {
            Some(job) => info!(
                job_id = %job.id,
                job_type = %job.job_type,
                claimant = request.claimant.as_deref().unwrap_or("-"),
                "job locked"
            ),
            None => debug!(
                candidates = ?request.job_types,
                tenant = %request.tenant,
                "no job available"
            ),
        }
        Ok(claimed)
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.queue.get(id).await?.ok_or(ScanError::NotFound(id))
    }

    /// Signed write URL for a result file of an existing job.
    pub async fn issue_upload_url(
        &self,
        job_id: JobId,
        file_name: &str,
    ) -> Result<Url> {
        self.get(job_id).await?;
        let key = result_key(job_id, file_name)?;
        let url = self.storage.presign(UrlMethod::Put, &key).await?;
        debug!(job_id = %job_id, key = %key, "issued upload url");
        Ok(url)
    }

    pub async fn mark_running(
        &self,
        job_id: JobId,
        workload: &str,
    ) -> Result<Job> {
        let job = self.queue.mark_running(job_id, workload).await?;
        info!(
            job_id = %job_id,
            workload,
            state = %job.state,
            "workload recorded"
        );
        Ok(job)
    }

    /// Records the uploaded files, replacing any earlier report. Each file
    /// with a result type gets one parse job, queued together with the
    /// completion. A file whose download URL cannot be signed is retried on
    /// the next report.
    pub async fn report_completion(
        &self,
        job_id: JobId,
        files: Vec<UploadedFile>,
    ) -> Result<Job> {
        let job = self.get(job_id).await?;
        let mut parse_jobs = Vec::new();
        if self.settings.auto_parse {
            for file in &files {
                let Some(result_type) = file.result_type.as_deref() else {
                    continue;
                };
                if job.has_parse_job(file) {
                    continue;
                }
                match self
                    .parse_submission(&job, &file.file_name, result_type)
                    .await
                {
                    Ok(submission) => parse_jobs.push(ParseJob {
                        file: file.clone(),
                        job: Job::from_submission(submission),
                    }),
                    Err(err) => error!(
                        job_id = %job_id,
                        file = %file.file_name,
                        error = %err,
                        "failed to prepare parse job"
                    ),
                }
            }
        }

        let record = self.queue.complete(job_id, files, parse_jobs).await?;
        info!(
            job_id = %job_id,
            files = record.job.uploaded_files.len(),
            parse_jobs = record.parse_jobs.len(),
            "job completed"
        );
        Ok(record.job)
    }

    async fn parse_submission(
        &self,
        job: &Job,
        file_name: &str,
        result_type: &str,
    ) -> Result<JobSubmission> {
        let key = result_key(job.id, file_name)?;
        let download = self.storage.presign(UrlMethod::Get, &key).await?;
        Ok(JobSubmission::new(
            parse_job_type(result_type),
            job.tenant.clone(),
            vec![download.to_string(), job.id.to_string()],
        )
        .with_metadata(JobMetadata {
            owner: Some(OwnerReference::scan(job)),
            ..JobMetadata::default()
        }))
    }

    /// Stores the findings summary. The first report for a job that
    /// declares cascades runs the rule engine, and the follow-ups are queued
    /// in the same step that marks the job as evaluated.
    pub async fn record_findings(
        &self,
        job_id: JobId,
        findings: Vec<Finding>,
    ) -> Result<Vec<JobId>> {
        let job = self.get(job_id).await?;
        let follow_ups: Vec<Job> =
            match (&job.cascades, job.cascade_evaluated_at) {
                (Some(cascades), None) => {
                    let rules = self.rules.rules(&cascades.selector).await?;
                    plan_cascades(&job, &findings, &rules)
                        .into_iter()
                        .map(Job::from_submission)
                        .collect()
                }
                _ => Vec::new(),
            };
        let planned: Vec<(JobId, String, String)> = follow_ups
            .iter()
            .map(|job| {
                (job.id, job.job_type.clone(), job.name().to_string())
            })
            .collect();

        let summary = FindingsSummary::from_findings(&findings);
        let record = self
            .queue
            .record_findings(job_id, summary, follow_ups)
            .await?;
        info!(job_id = %job_id, findings = findings.len(), "findings recorded");

        if !record.first_report {
            debug!(job_id = %job_id, "findings already evaluated for cascades");
            return Ok(Vec::new());
        }
        for (id, job_type, name) in &planned {
            info!(
                parent = %job_id,
                job_id = %id,
                job_type = %job_type,
                name = %name,
                "cascading scan queued"
            );
        }
        Ok(record.cascaded)
    }

    pub async fn queue_depth(
        &self,
        tenant: &str,
        job_type: &str,
    ) -> Result<usize> {
        self.queue.queue_depth(tenant, job_type).await
    }
}

#[async_trait]
impl JobBroker for ScanJobService {
    async fn claim_next(
        &self,
        request: &ClaimRequest,
    ) -> Result<Option<LockedJob>> {
        Ok(ScanJobService::claim_next(self, request)
            .await?
            .as_ref()
            .map(LockedJob::from))
    }

    async fn issue_upload_url(
        &self,
        job_id: JobId,
        file_name: &str,
    ) -> Result<Url> {
        ScanJobService::issue_upload_url(self, job_id, file_name).await
    }

    async fn mark_running(&self, job_id: JobId, workload: &str) -> Result<()> {
        ScanJobService::mark_running(self, job_id, workload)
            .await
            .map(|_| ())
    }

    async fn report_completion(
        &self,
        job_id: JobId,
        files: Vec<UploadedFile>,
    ) -> Result<()> {
        if let Err(err) =
            ScanJobService::report_completion(self, job_id, files).await
        {
            warn!(job_id = %job_id, error = %err, "completion report rejected");
            return Err(err);
        }
        Ok(())
    }
}
