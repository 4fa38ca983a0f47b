//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Broker closed the connection: {0}")]
    Closed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    pub fn publish_failed(msg: impl Into<String>) -> Self {
        Self::PublishFailed(msg.into())
    }

    /// Whether a consumer should reconnect rather than exit.
    ///
    /// Dropped or refused connections, IO errors, timeouts and a purged
    /// stream are recoverable; other server-side faults and an explicit close
    /// are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            QueueError::ConnectionFailed(_) | QueueError::Timeout(_) => true,
            QueueError::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_io_error()
                    || e.is_timeout()
                    || is_stream_reset(e)
            }
            QueueError::Closed(_)
            | QueueError::PublishFailed(_)
            | QueueError::Serialization(_)
            | QueueError::Json(_) => false,
        }
    }
}

/// A blocked group read woken because the stream or its consumer group was
/// recreated by a purge.
pub(crate) fn is_stream_reset(e: &redis::RedisError) -> bool {
    let message = e.to_string();
    message.contains("NOGROUP") || message.contains("UNBLOCKED")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(QueueError::connection_failed("refused").is_recoverable());
        assert!(QueueError::Timeout("ping".into()).is_recoverable());
        assert!(!QueueError::closed("shutdown").is_recoverable());

        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(QueueError::Redis(io).is_recoverable());

        let server = redis::RedisError::from((redis::ErrorKind::ResponseError, "WRONGTYPE"));
        assert!(!QueueError::Redis(server).is_recoverable());
    }

    #[test]
    fn test_purged_stream_replies_are_recoverable() {
        let unblocked = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "UNBLOCKED",
            "the stream key no longer exists".to_string(),
        ));
        assert!(is_stream_reset(&unblocked));
        assert!(QueueError::Redis(unblocked).is_recoverable());

        let no_group = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "NOGROUP",
            "No such key 'vrender:work' or consumer group".to_string(),
        ));
        assert!(QueueError::Redis(no_group).is_recoverable());
    }
}
