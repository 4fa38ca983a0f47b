//! Storage abstraction for the VRender pipeline.
//!
//! This crate provides:
//! - Endpoint parsing (local paths, `smb://` shares, `s3://` object stores)
//! - Download / upload / list / copy dispatching on the endpoint scheme
//! - Per-frame tar archives for packaged image types
//! - Include/exclude glob filters
//! - The canonical image-type directory layout

pub mod archive;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod layout;
pub mod object_store;
pub mod operations;

pub use client::{Location, Storage};
pub use config::StorageConfig;
pub use endpoint::{join_address, Endpoint, Scheme};
pub use error::{StorageError, StorageResult};
pub use filter::GlobFilter;
pub use layout::{image_type_relative_path, remote_image_type_path, LocalRoots};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use operations::frame_filter;
