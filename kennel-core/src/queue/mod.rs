//! Tenant and type partitioned job queue with atomic claim.

mod memory;
#[cfg(feature = "database")]
mod postgres;

pub use memory::InMemoryQueueService;
#[cfg(feature = "database")]
pub use postgres::PostgresQueueService;

use async_trait::async_trait;
use kennel_model::{
    FindingsSummary, Job, JobId, UploadedFile, wire::LockRequest,
};

use crate::error::Result;

/// Which queues to claim from, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub job_types: Vec<String>,
    pub tenant: String,
    pub claimant: Option<String>,
}

impl ClaimRequest {
    pub fn new(
        job_types: Vec<String>,
        tenant: impl Into<String>,
        claimant: Option<String>,
    ) -> Self {
        Self {
            job_types,
            tenant: tenant.into(),
            claimant,
        }
    }
}

impl From<LockRequest> for ClaimRequest {
    fn from(req: LockRequest) -> Self {
        Self {
            job_types: req.job_types,
            tenant: req.tenant,
            claimant: req.claimant,
        }
    }
}

impl From<&ClaimRequest> for LockRequest {
    fn from(req: &ClaimRequest) -> Self {
        Self {
            job_types: req.job_types.clone(),
            tenant: req.tenant.clone(),
            claimant: req.claimant.clone(),
        }
    }
}

/// A parse job for one completed result file.
#[derive(Debug, Clone)]
pub struct ParseJob {
    pub file: UploadedFile,
    pub job: Job,
}

/// Result of recording a completion. `parse_jobs` are the ids of the parse
/// jobs this report queued.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub job: Job,
    pub parse_jobs: Vec<JobId>,
}

/// Result of recording findings. `first_report` is true exactly once per
/// job, for whichever caller stored findings first, and only that caller's
/// follow-up jobs are queued.
#[derive(Debug, Clone)]
pub struct FindingsRecord {
    pub job: Job,
    pub first_report: bool,
    pub cascaded: Vec<JobId>,
}

/// Abstracts the queue backend consumed by the engine service.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Stores a `Queued` job and appends it to its tenant and type queue.
    async fn enqueue(&self, job: Job) -> Result<JobId>;

    /// Pops the head of the first non-empty queue among `job_types` and
    /// marks that job `Locked`. Two concurrent calls never return the same
    /// job. `None` means every candidate queue was empty.
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Job>>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// `Locked -> Running`, attaching the workload name.
    async fn mark_running(&self, id: JobId, workload: &str) -> Result<Job>;

    /// Moves the job to `Completed`, replacing any earlier file list, and
    /// queues `parse_jobs` in the same step. A parse job for a file that
    /// already got one is dropped. On error nothing is stored.
    async fn complete(
        &self,
        id: JobId,
        files: Vec<UploadedFile>,
        parse_jobs: Vec<ParseJob>,
    ) -> Result<CompletionRecord>;

    /// Overwrites the findings summary. On the first report the follow-up
    /// jobs are queued in the same step as the flag flips, later reports
    /// drop them. On error nothing is stored.
    async fn record_findings(
        &self,
        id: JobId,
        summary: FindingsSummary,
        follow_ups: Vec<Job>,
    ) -> Result<FindingsRecord>;

    /// Number of jobs still queued for `tenant` and `job_type`.
    async fn queue_depth(&self, tenant: &str, job_type: &str) -> Result<usize>;

    /// Enqueue multiple jobs, all or none.
    async fn enqueue_many(&self, jobs: Vec<Job>) -> Result<Vec<JobId>>;
}
