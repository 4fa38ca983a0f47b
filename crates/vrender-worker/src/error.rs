//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    #[error("{binary} exited with {status}")]
    BinaryFailed { binary: String, status: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] vrender_storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] vrender_queue::QueueError),

    #[error("Model error: {0}")]
    Model(#[from] vrender_models::ModelError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn missing_input(msg: impl Into<String>) -> Self {
        Self::MissingInput(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether the consumption loop should reconnect rather than exit.
    pub fn is_recoverable(&self) -> bool {
        match self {
            WorkerError::Queue(e) => e.is_recoverable(),
            _ => false,
        }
    }
}
