//! Shared data models for the VRender pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Frame names and frame chunks
//! - Image types, pyramid levels and their storage layout
//! - Stage kinds (the closed set of pipeline steps)
//! - Job messages exchanged between the controller and workers

pub mod error;
pub mod frame;
pub mod image_type;
pub mod job;
pub mod stage;

pub use error::{ModelError, ModelResult};
pub use frame::{frame_name, frame_range, FrameChunk, FrameName};
pub use image_type::{finest_level_for, num_levels, ImageType, LevelSpec, RootKind, PYRAMID_WIDTHS};
pub use job::{FlagValue, JobMessage};
pub use stage::StageKind;
