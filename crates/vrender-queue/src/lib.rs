//! Work and response queues for the VRender pipeline.
//!
//! This crate provides:
//! - The [`Broker`] trait shared by the controller and workers
//! - A Redis Streams broker with consumer groups, retry bounds and a dead-letter stream
//! - Heartbeat-based worker liveness
//! - An in-process broker for tests and single-host runs
//! - Retry helpers with exponential backoff

pub mod broker;
pub mod config;
pub mod error;
pub mod memory;
pub mod redis_broker;
pub mod retry;

pub use broker::{payload_digest, Broker, CompletionCursor, Delivery, QueueDepth, QueueState, RejectOutcome};
pub use config::{QueueConfig, COMPLETION_TOKEN, DEAD_LETTER_QUEUE, RESPONSE_QUEUE, WORK_QUEUE};
pub use error::{QueueError, QueueResult};
pub use memory::{DeadLetter, MemoryBroker};
pub use redis_broker::RedisBroker;
pub use retry::{retry_async, FailureTracker, RetryConfig, RetryResult};
