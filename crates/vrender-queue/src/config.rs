//! Queue names and broker configuration.

use std::time::Duration;

/// Stream holding dispatched job messages.
pub const WORK_QUEUE: &str = "vrender:work";
/// Stream receiving one completion token per finished job.
pub const RESPONSE_QUEUE: &str = "vrender:response";
/// Stream receiving jobs that exhausted their attempts.
pub const DEAD_LETTER_QUEUE: &str = "vrender:dead";
/// Body of every completion token.
pub const COMPLETION_TOKEN: &str = "Completed!";

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Consumer group workers read the work stream through
    pub consumer_group: String,
    /// Sorted set of live workers, scored by last heartbeat
    pub worker_registry: String,
    /// A worker is live while its last heartbeat is younger than this
    pub heartbeat_ttl: Duration,
    /// Failures before a job is dead-lettered; 0 retries forever
    pub max_attempts: u32,
    /// Idle time after which a delivery held by a consumer with an expired
    /// heartbeat is re-claimed
    pub claim_min_idle: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            consumer_group: "vrender:workers".to_string(),
            worker_registry: "vrender:live".to_string(),
            heartbeat_ttl: Duration::from_secs(15),
            max_attempts: 5,
            claim_min_idle: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            worker_registry: std::env::var("QUEUE_WORKER_REGISTRY")
                .unwrap_or(defaults.worker_registry),
            heartbeat_ttl: std::env::var("QUEUE_HEARTBEAT_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_ttl),
            max_attempts: std::env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            claim_min_idle: std::env::var("QUEUE_CLAIM_MIN_IDLE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_min_idle),
        }
    }

    /// Config pointing at `redis_url` with default settings.
    pub fn with_url(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..Default::default()
        }
    }
}
