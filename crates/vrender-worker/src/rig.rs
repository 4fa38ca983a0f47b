//! Camera rig descriptor.

use std::path::Path;

use serde::Deserialize;

use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone, Deserialize)]
pub struct RigCamera {
    pub id: String,
    /// Full-size `[width, height]`
    #[serde(default)]
    pub resolution: Vec<u32>,
}

/// The parts of a rig file the worker reads.
#[derive(Debug, Clone, Deserialize)]
pub struct Rig {
    pub cameras: Vec<RigCamera>,
}

impl Rig {
    pub fn from_json(json: &str) -> WorkerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: &Path) -> WorkerResult<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| WorkerError::missing_input(format!("rig {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Camera ids, sorted.
    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.iter().map(|c| c.id.clone()).collect();
        ids.sort();
        ids
    }
}
