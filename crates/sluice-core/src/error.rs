//! Error types for Sluice.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Invalid pipeline graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid trigger {trigger}: {message}")]
    InvalidTrigger { trigger: String, message: String },

    // Lookup errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // Admission errors
    #[error("Run rejected for pipeline {pipeline_id}: {reason}")]
    RunRejected { pipeline_id: String, reason: String },

    #[error("Run already completed: {0}")]
    RunAlreadyCompleted(String),

    #[error("Invalid run transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // Infrastructure errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the addressed entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PipelineNotFound(_) | Error::RunNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
