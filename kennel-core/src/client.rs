//! HTTP client for the engine's `/api/v1alpha/scan-job` surface.

use std::time::Duration;

use async_trait::async_trait;
use kennel_model::{
    Finding, JobId, UploadedFile,
    wire::{
        CompletionRequest, FindingsRequest, FindingsResponse, LockRequest,
        LockedJob, RequestedFileDefinition, ScanView, SubmitRequest,
        SubmitResponse, UploadUrlRequest, WorkloadRequest,
    },
};
use reqwest::{Response, StatusCode};
use tracing::debug;
use url::Url;

use crate::{
    broker::JobBroker,
    error::{Result, ScanError},
    queue::ClaimRequest,
};

pub const API_PREFIX: &str = "/api/v1alpha/scan-job";

#[derive(Debug, Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    base: String,
}

impl EngineClient {
    pub fn new(engine_address: &Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(http, engine_address))
    }

    pub fn with_client(http: reqwest::Client, engine_address: &Url) -> Self {
        Self {
            http,
            base: engine_address.as_str().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        debug!(status = %status, url = %url, body = %body, "engine request failed");
        Err(ScanError::HttpStatus { status, url })
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<JobId> {
        let response = self
            .http
            .put(self.endpoint("/"))
            .json(request)
            .send()
            .await?;
        let created: SubmitResponse = Self::check(response).await?.json().await?;
        Ok(created.id)
    }

    pub async fn lock(&self, request: &LockRequest) -> Result<Option<LockedJob>> {
        let response = self
            .http
            .post(self.endpoint("/lock"))
            .json(request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    pub async fn get(&self, id: JobId) -> Result<ScanView> {
        let response = self.http.get(self.endpoint(&format!("/{id}"))).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn request_upload_url(&self, scan_id: JobId, file_name: &str) -> Result<Url> {
        let request = UploadUrlRequest {
            scan_id,
            requested_file_definition: RequestedFileDefinition {
                file_name: file_name.to_string(),
            },
        };
        let response = self
            .http
            .post(self.endpoint("/request-file-upload-urls"))
            .json(&request)
            .send()
            .await?;
        let body = Self::check(response).await?.text().await?;
        Url::parse(body.trim().trim_matches('"')).map_err(|e| {
            ScanError::Internal(format!("engine returned an invalid upload url: {e}"))
        })
    }

    pub async fn report_workload(&self, id: JobId, workload_name: &str) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint(&format!("/{id}/workload")))
            .json(&WorkloadRequest {
                workload_name: workload_name.to_string(),
            })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn scan_completion(&self, id: JobId, files: Vec<UploadedFile>) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint(&format!("/{id}/scan-completion")))
            .json(&CompletionRequest { files })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn findings(&self, id: JobId, findings: Vec<Finding>) -> Result<Vec<JobId>> {
        let response = self
            .http
            .post(self.endpoint(&format!("/{id}/findings")))
            .json(&FindingsRequest { findings })
            .send()
            .await?;
        let body: FindingsResponse = Self::check(response).await?.json().await?;
        Ok(body.cascaded_jobs)
    }
}

#[async_trait]
impl JobBroker for EngineClient {
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<LockedJob>> {
        self.lock(&LockRequest::from(request)).await
    }

    async fn issue_upload_url(&self, job_id: JobId, file_name: &str) -> Result<Url> {
        self.request_upload_url(job_id, file_name).await
    }

    async fn mark_running(&self, job_id: JobId, workload: &str) -> Result<()> {
        self.report_workload(job_id, workload).await
    }

    async fn report_completion(&self, job_id: JobId, files: Vec<UploadedFile>) -> Result<()> {
        self.scan_completion(job_id, files).await
    }
}
