//! The slice of the engine that dispatchers and sidecars talk to.

use async_trait::async_trait;
use kennel_model::{JobId, UploadedFile, wire::LockedJob};
use url::Url;

use crate::{error::Result, queue::ClaimRequest};

/// Engine operations used by the dispatcher and the lurcher. Implemented
/// over HTTP by [`EngineClient`](crate::EngineClient) and in process by
/// [`ScanJobService`](crate::ScanJobService).
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// `None` when every candidate queue is empty.
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<LockedJob>>;

    /// Write URL for `file_name` under the job's result prefix.
    async fn issue_upload_url(&self, job_id: JobId, file_name: &str) -> Result<Url>;

    async fn mark_running(&self, job_id: JobId, workload: &str) -> Result<()>;

    async fn report_completion(&self, job_id: JobId, files: Vec<UploadedFile>) -> Result<()>;
}
