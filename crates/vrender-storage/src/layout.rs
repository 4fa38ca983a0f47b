//! Canonical directory layout of image types.

use std::path::{Path, PathBuf};

use vrender_models::{ImageType, JobMessage, RootKind};

use crate::endpoint::join_address;
use crate::error::StorageResult;

/// Path of `image_type` at `level` relative to its root.
///
/// Leveled requests resolve to `<leveled type path>/level_<n>`.
pub fn image_type_relative_path(image_type: ImageType, level: Option<u32>) -> StorageResult<String> {
    let resolved = image_type.at_level(level)?;
    Ok(match level {
        Some(level) => format!("{}/level_{}", resolved.relative_path(), level),
        None => resolved.relative_path().to_string(),
    })
}

/// Address of `image_type` at `level` under the job's remote roots.
pub fn remote_image_type_path(
    msg: &JobMessage,
    image_type: ImageType,
    level: Option<u32>,
) -> StorageResult<String> {
    let relative = image_type_relative_path(image_type, level)?;
    let root = match image_type.at_level(level)?.root() {
        RootKind::Input => &msg.input_root,
        RootKind::Output => &msg.output_root,
    };
    Ok(join_address(root, &relative))
}

/// Roots a job reads and writes on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRoots {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl LocalRoots {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    pub fn root(&self, kind: RootKind) -> &Path {
        match kind {
            RootKind::Input => &self.input,
            RootKind::Output => &self.output,
        }
    }

    /// Local directory of `image_type` at `level`.
    pub fn image_type_path(&self, image_type: ImageType, level: Option<u32>) -> StorageResult<PathBuf> {
        let relative = image_type_relative_path(image_type, level)?;
        let kind = image_type.at_level(level)?.root();
        Ok(self.root(kind).join(relative))
    }

    /// Local path of the job's rig file.
    pub fn rig_path(&self, msg: &JobMessage) -> PathBuf {
        let input_root = msg.input_root.trim_end_matches('/');
        match msg.rig.strip_prefix(input_root) {
            Some(rest) if !input_root.is_empty() => self.input.join(rest.trim_start_matches('/')),
            _ => {
                let file_name = msg.rig.rsplit('/').next().unwrap_or("rig.json");
                self.input.join(file_name)
            }
        }
    }
}
