//! Pipeline error types.

use std::time::Duration;

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No workers for {waited:?} while running {stage}. Check worker logs for errors")]
    NoWorkers { stage: String, waited: Duration },

    #[error("{count} job(s) of {stage} were dead-lettered")]
    DeadLettered { stage: String, count: u64 },

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Worker fleet error: {0}")]
    Fleet(String),

    #[error("Queue error: {0}")]
    Queue(#[from] vrender_queue::QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] vrender_storage::StorageError),

    #[error("Model error: {0}")]
    Model(#[from] vrender_models::ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn broker_unavailable(msg: impl Into<String>) -> Self {
        Self::BrokerUnavailable(msg.into())
    }

    pub fn fleet(msg: impl Into<String>) -> Self {
        Self::Fleet(msg.into())
    }
}
