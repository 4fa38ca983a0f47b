//! Render pipeline controller.
//!
//! This crate provides:
//! - Stage planning: the messages and chunks each render stage dispatches
//! - Frame-chunk cache checking against the destination listing
//! - Drain cycles with progress, dead-letter detection and worker liveness
//! - Broker bootstrap and local worker fleet management

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod fleet;
pub mod liveness;
pub mod progress;
pub mod stages;

pub use bootstrap::BrokerBootstrap;
pub use cache::CacheChecker;
pub use config::{parse_flagfile, read_flagfile, PipelineConfig, RenderConfig, StageToggles};
pub use controller::Pipeline;
pub use error::{PipelineError, PipelineResult};
pub use fleet::{parse_worker_specs, WorkerFleet, WorkerSpec};
pub use liveness::LivenessMonitor;
pub use progress::StageProgress;
pub use stages::{standard_stages, Dispatch, FilterWindow, Stage};
