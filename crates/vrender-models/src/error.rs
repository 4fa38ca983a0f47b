//! Model error types.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid frame name: {0}")]
    InvalidFrame(String),

    #[error("Invalid frame chunk: {0}")]
    InvalidChunk(String),

    #[error("Unknown image type: {0}")]
    UnknownImageType(String),

    #[error("Image type {0} has no leveled variant")]
    NotLeveled(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    pub fn invalid_chunk(msg: impl Into<String>) -> Self {
        Self::InvalidChunk(msg.into())
    }
}
