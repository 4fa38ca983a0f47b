//! Render worker.
//!
//! This crate provides:
//! - Job executor consuming stage jobs from the broker
//! - Stage handlers that stage inputs, run a compute binary and publish outputs
//! - Flag introspection and invocation of the compute binaries
//! - Graceful shutdown

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod rewrite;
pub mod rig;
pub mod runner;

#[cfg(test)]
mod testing;

pub use config::WorkerConfig;
pub use context::JobContext;
pub use dispatch::{DispatchTable, StageHandler};
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use runner::BinaryRunner;
