use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidState(String),
    InvalidTransition { from: String, to: String },
    DuplicateChainEntry(String),
    InvalidArgument(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidState(raw) => {
                write!(f, "unknown job state: {raw}")
            }
            ModelError::InvalidTransition { from, to } => {
                write!(f, "job cannot move from {from} to {to}")
            }
            ModelError::DuplicateChainEntry(rule) => {
                write!(f, "cascading rule {rule} already present in chain")
            }
            ModelError::InvalidArgument(msg) => {
                write!(f, "invalid argument: {msg}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
