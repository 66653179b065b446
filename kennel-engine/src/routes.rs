use axum::{
    Router,
    routing::{get, post, put},
};
use kennel_core::client::API_PREFIX;
use tower_http::trace::TraceLayer;

use crate::{AppState, handlers};

/// Routes under [`API_PREFIX`]. Submission is reachable with and without
/// a trailing slash.
pub fn scan_job_routes() -> Router<AppState> {
    Router::new()
        .route(API_PREFIX, put(handlers::submit_job))
        .route(&format!("{API_PREFIX}/"), put(handlers::submit_job))
        .route(&format!("{API_PREFIX}/lock"), post(handlers::lock_job))
        .route(
            &format!("{API_PREFIX}/request-file-upload-urls"),
            post(handlers::request_upload_url),
        )
        .route(
            &format!("{API_PREFIX}/{{id}}/scan-completion"),
            post(handlers::scan_completion),
        )
        .route(
            &format!("{API_PREFIX}/{{id}}/workload"),
            post(handlers::report_workload),
        )
        .route(
            &format!("{API_PREFIX}/{{id}}/findings"),
            post(handlers::report_findings),
        )
        .route(&format!("{API_PREFIX}/{{id}}"), get(handlers::get_job))
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(scan_job_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
