//! Stage handlers.
//!
//! Each handler declares the (image type, level) inputs its binary reads,
//! fetches them, points the binary's path flags at the local copies, runs it
//! and pushes the outputs back.

mod binary;
mod depth;
mod export;
mod masks;
mod resize;
mod temporal;
mod transfer;
mod upsample;

pub use binary::{fused_json_name, BinaryHandler};
pub use depth::DepthHandler;
pub use export::ExportHandler;
pub use masks::MasksHandler;
pub use resize::ResizeHandler;
pub use temporal::TemporalFilterHandler;
pub use transfer::TransferHandler;
pub use upsample::UpsampleHandler;
