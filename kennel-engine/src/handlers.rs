use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kennel_core::ClaimRequest;
use kennel_model::{
    JobId, JobSubmission,
    wire::{
        CompletionRequest, FindingsRequest, FindingsResponse, LockRequest,
        LockedJob, ScanView, SubmitRequest, SubmitResponse, UploadUrlRequest,
        WorkloadRequest,
    },
};
use tracing::debug;

use crate::{AppState, errors::AppResult};

pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let job_type = request.job_type.clone();
    let id = state.service.submit(JobSubmission::from(request)).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            id,
            message: format!("queued {job_type} job {id}"),
        }),
    ))
}

/// `200` with the claimed job, `204` when every requested queue is empty.
pub async fn lock_job(
    State(state): State<AppState>,
    Json(request): Json<LockRequest>,
) -> AppResult<Response> {
    let claim = ClaimRequest::from(request);
    match state.service.claim_next(&claim).await? {
        Some(job) => Ok(Json(LockedJob::from(&job)).into_response()),
        None => {
            debug!(candidates = ?claim.job_types, "lock request found no job");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// The presigned URL as the plain response body.
pub async fn request_upload_url(
    State(state): State<AppState>,
    Json(request): Json<UploadUrlRequest>,
) -> AppResult<String> {
    let url = state
        .service
        .issue_upload_url(
            request.scan_id,
            &request.requested_file_definition.file_name,
        )
        .await?;
    Ok(url.to_string())
}

pub async fn scan_completion(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(request): Json<CompletionRequest>,
) -> AppResult<StatusCode> {
    state.service.report_completion(id, request.files).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn report_workload(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(request): Json<WorkloadRequest>,
) -> AppResult<StatusCode> {
    state
        .service
        .mark_running(id, &request.workload_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn report_findings(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(request): Json<FindingsRequest>,
) -> AppResult<Json<FindingsResponse>> {
    let cascaded_jobs = state.service.record_findings(id, request.findings).await?;
    Ok(Json(FindingsResponse { cascaded_jobs }))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<Json<ScanView>> {
    let job = state.service.get(id).await?;
    Ok(Json(ScanView::from(&job)))
}

pub async fn healthz() -> &'static str {
    "ok"
}
