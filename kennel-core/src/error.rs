use kennel_model::{JobId, ModelError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} from {url}")]
    HttpStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Infrastructure failures that should be retried on the next loop
    /// iteration instead of being treated as "no work" or a bad request.
    pub fn is_transient(&self) -> bool {
        match self {
            ScanError::QueueUnavailable(_)
            | ScanError::StorageUnavailable(_)
            | ScanError::Cluster(_)
            | ScanError::Http(_) => true,
            ScanError::HttpStatus { status, .. } => {
                status.as_u16() == 429 || status.is_server_error()
            }
            #[cfg(feature = "database")]
            ScanError::Database(err) => !matches!(err, sqlx::Error::RowNotFound),
            ScanError::NotFound(_)
            | ScanError::InvalidJob(_)
            | ScanError::InvalidTransition(_)
            | ScanError::Io(_)
            | ScanError::Serialization(_)
            | ScanError::Internal(_) => false,
        }
    }
}

impl From<ModelError> for ScanError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidTransition { .. } => {
                ScanError::InvalidTransition(err.to_string())
            }
            other => ScanError::InvalidJob(other.to_string()),
        }
    }
}

impl From<kube::Error> for ScanError {
    fn from(err: kube::Error) -> Self {
        ScanError::Cluster(err.to_string())
    }
}

impl From<object_store::Error> for ScanError {
    fn from(err: object_store::Error) -> Self {
        ScanError::StorageUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
