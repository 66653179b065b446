//! HTTP surface of the kennel engine: job submission, claiming, result
//! upload URLs, completion and findings reports.

pub mod errors;
pub mod handlers;
pub mod routes;

use std::sync::Arc;

use kennel_core::ScanJobService;

pub use routes::create_app;

#[derive(Clone, Debug)]
pub struct AppState {
    pub service: Arc<ScanJobService>,
}

impl AppState {
    pub fn new(service: ScanJobService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}
