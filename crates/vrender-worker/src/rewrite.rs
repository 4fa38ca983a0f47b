//! Scratch roots and remote-to-local path rewriting.
//!
//! Roots that resolve to a local path (plain paths and mounted shares) are
//! used in place. Object-store roots are mirrored under a per-job scratch
//! directory, and every path parameter handed to a binary is rewritten to
//! point there.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;
use vrender_models::JobMessage;
use vrender_storage::{LocalRoots, Storage};

use crate::error::WorkerResult;

/// Per-job scratch directory, removed after the job.
#[derive(Debug, Clone)]
pub struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    pub fn new(scratch_dir: &Path) -> Self {
        Self {
            dir: scratch_dir.join(format!("job-{}", Uuid::new_v4())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input(&self) -> PathBuf {
        self.dir.join("input")
    }

    pub fn output(&self) -> PathBuf {
        self.dir.join("output")
    }

    /// Local roots of `msg`: its own paths where they are local, scratch otherwise.
    pub fn roots_for(&self, storage: &Storage, msg: &JobMessage) -> WorkerResult<LocalRoots> {
        let input = storage.local_path(&msg.input_root)?.unwrap_or_else(|| self.input());
        let output = storage.local_path(&msg.output_root)?.unwrap_or_else(|| self.output());
        Ok(LocalRoots::new(input, output))
    }

    pub async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!(dir = %self.dir.display(), "Removed scratch"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), "Failed to remove scratch: {}", e),
        }
    }
}

/// A root match must end at a path separator or outside a path component.
fn ends_root(tail: &str) -> bool {
    tail.chars()
        .next()
        .map_or(true, |c| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.')))
}

/// Replaces a job's remote roots with its local roots inside parameter values.
#[derive(Debug, Clone, Default)]
pub struct PathRewriter {
    replacements: Vec<(String, String)>,
}

impl PathRewriter {
    pub fn new(msg: &JobMessage, roots: &LocalRoots) -> Self {
        let mut replacements: Vec<(String, String)> = [
            (msg.input_root.as_str(), roots.input.as_path()),
            (msg.output_root.as_str(), roots.output.as_path()),
        ]
        .into_iter()
        .map(|(remote, local)| {
            (
                remote.trim_end_matches('/').to_string(),
                local.to_string_lossy().trim_end_matches('/').to_string(),
            )
        })
        .filter(|(remote, local)| !remote.is_empty() && remote != local)
        .collect();

        // A root containing the other is replaced first
        replacements.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { replacements }
    }

    pub fn is_identity(&self) -> bool {
        self.replacements.is_empty()
    }

    /// Replace every whole root occurrence in one pass; `s3://b/shot` never
    /// matches inside `s3://b/shot2`.
    pub fn rewrite(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;

        'scan: while !rest.is_empty() {
            for (remote, local) in &self.replacements {
                if let Some(tail) = rest.strip_prefix(remote.as_str()) {
                    if ends_root(tail) {
                        out.push_str(local);
                        rest = tail;
                        continue 'scan;
                    }
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
        out
    }

    pub fn rewrite_flags(&self, flags: BTreeMap<String, String>) -> BTreeMap<String, String> {
        if self.is_identity() {
            return flags;
        }
        flags
            .into_iter()
            .map(|(name, value)| {
                let value = self.rewrite(&value);
                (name, value)
            })
            .collect()
    }
}
