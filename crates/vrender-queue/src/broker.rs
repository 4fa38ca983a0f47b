//! Broker abstraction shared by the controller and workers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use vrender_models::JobMessage;

use crate::error::{QueueError, QueueResult};

/// Depth and consumer count of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub consumers: u64,
}

/// Snapshot of both queues plus the dead-letter count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub work: QueueDepth,
    pub response: QueueDepth,
    pub dead_lettered: u64,
}

impl QueueState {
    /// Completion tokens received since the last purge.
    pub fn completed(&self) -> u64 {
        self.response.pending
    }

    /// Workers currently alive.
    pub fn live_workers(&self) -> u64 {
        self.work.consumers
    }
}

/// A job handed to one consumer, awaiting ack or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned delivery id
    pub id: String,
    /// Serialized job message, byte-identical to what was published
    pub payload: String,
}

impl Delivery {
    pub fn digest(&self) -> String {
        payload_digest(&self.payload)
    }
}

/// What happened to a rejected delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Republished to the work queue.
    Requeued { attempts: u32 },
    /// Attempts exhausted; moved to the dead-letter queue.
    DeadLettered { attempts: u32 },
    /// The delivery was already settled or handed to another consumer;
    /// nothing was changed.
    Stale,
}

/// Read position in the response queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionCursor(pub(crate) String);

impl CompletionCursor {
    /// Cursor before the first completion.
    pub fn start() -> Self {
        Self("0-0".to_string())
    }
}

impl Default for CompletionCursor {
    fn default() -> Self {
        Self::start()
    }
}

/// SHA-256 of a payload, hex encoded. Identifies a job across republishes.
pub fn payload_digest(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Durable work/response queue pair.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Check connectivity.
    async fn ping(&self) -> QueueResult<()>;

    /// Create whatever the queues need before the first fetch.
    async fn init(&self) -> QueueResult<()> {
        Ok(())
    }

    /// Discard everything in the work and response queues.
    async fn purge(&self) -> QueueResult<()>;

    /// Publish one job payload to the work queue.
    async fn publish(&self, payload: &str) -> QueueResult<()>;

    /// Serialize and publish a job message.
    async fn publish_job(&self, job: &JobMessage) -> QueueResult<()> {
        let payload = job
            .to_json()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.publish(&payload).await
    }

    async fn state(&self) -> QueueResult<QueueState>;

    /// Block until completions arrive after `cursor` or `timeout` elapses.
    ///
    /// Returns the number of new completions and advances the cursor.
    async fn wait_for_completions(&self, cursor: &mut CompletionCursor, timeout: Duration) -> QueueResult<u64>;

    /// Mark `consumer` alive.
    async fn heartbeat(&self, consumer: &str) -> QueueResult<()>;

    /// Remove `consumer` from the live set.
    async fn deregister(&self, consumer: &str) -> QueueResult<()>;

    /// Take the next job for `consumer`, waiting at most `block`.
    async fn fetch(&self, consumer: &str, block: Duration) -> QueueResult<Option<Delivery>>;

    /// Hand `consumer` the deliveries held by consumers whose heartbeat expired.
    async fn claim_stale(&self, _consumer: &str) -> QueueResult<Vec<Delivery>> {
        Ok(Vec::new())
    }

    /// Acknowledge a delivery and publish its completion token.
    ///
    /// Returns `false`, publishing nothing, when the delivery was already
    /// settled, so each job yields at most one token.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<bool>;

    /// Reject a delivery: republish it unchanged, or dead-letter it once its
    /// attempts are exhausted.
    async fn reject(&self, delivery: &Delivery, reason: &str) -> QueueResult<RejectOutcome>;

    /// Move a delivery straight to the dead-letter queue. Returns `false` when
    /// it was already settled.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> QueueResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_and_content_addressed() {
        let a = payload_digest(r#"{"app":"Resize"}"#);
        assert_eq!(a.len(), 64);
        assert_eq!(a, payload_digest(r#"{"app":"Resize"}"#));
        assert_ne!(a, payload_digest(r#"{"app":"Resize" }"#));
    }

    #[test]
    fn test_state_accessors() {
        let state = QueueState {
            work: QueueDepth { pending: 3, consumers: 2 },
            response: QueueDepth { pending: 7, consumers: 0 },
            dead_lettered: 0,
        };
        assert_eq!(state.completed(), 7);
        assert_eq!(state.live_workers(), 2);
    }
}
