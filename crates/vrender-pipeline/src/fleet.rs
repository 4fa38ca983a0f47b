//! Worker fleet setup and teardown.
//!
//! Local replicas are child processes of the controller and are terminated
//! at the end of the run. Remote hosts run their own workers and are only
//! logged.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};

const LOCAL_HOSTS: [&str; 2] = ["127.0.0.1", "localhost"];

/// One `host[:replicas]` entry of the worker spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub host: String,
    pub replicas: u32,
}

impl WorkerSpec {
    pub fn is_local(&self) -> bool {
        LOCAL_HOSTS.contains(&self.host.as_str())
    }
}

/// Parse a comma separated `host[:replicas]` list. Replicas default to 1.
pub fn parse_worker_specs(spec: &str) -> PipelineResult<Vec<WorkerSpec>> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, replicas) = match entry.split_once(':') {
                Some((host, replicas)) => {
                    let replicas = replicas
                        .parse()
                        .map_err(|_| PipelineError::config_error(format!("Invalid replica count in {entry:?}")))?;
                    (host, replicas)
                }
                None => (entry, 1),
            };
            if host.is_empty() {
                return Err(PipelineError::config_error(format!("Missing host in {entry:?}")));
            }
            Ok(WorkerSpec {
                host: host.to_string(),
                replicas,
            })
        })
        .collect()
}

/// Worker processes started by this controller.
pub struct WorkerFleet {
    children: Vec<Child>,
    log_dir: PathBuf,
}

impl WorkerFleet {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            children: Vec::new(),
            log_dir: log_dir.into(),
        }
    }

    /// Start every local replica of the configured worker spec.
    pub fn start(config: &PipelineConfig, default_log_dir: &Path) -> PipelineResult<Self> {
        let log_dir = config
            .worker_log_dir
            .clone()
            .unwrap_or_else(|| default_log_dir.to_path_buf());
        let mut fleet = Self::new(log_dir);

        for spec in parse_worker_specs(&config.workers)? {
            if !spec.is_local() {
                info!(host = %spec.host, replicas = spec.replicas, "Remote workers are managed externally");
                continue;
            }
            for replica in 0..spec.replicas {
                fleet.spawn_local(&config.worker_binary, replica)?;
            }
        }
        Ok(fleet)
    }

    /// Start one local worker replica logging to `Worker-<timestamp>-<replica>`.
    pub fn spawn_local(&mut self, binary: &str, replica: u32) -> PipelineResult<u32> {
        let program = which::which(binary).map_err(|e| PipelineError::fleet(format!("cannot start {binary}: {e}")))?;
        self.spawn_logged(&program, &[], replica)
    }

    fn spawn_logged(&mut self, program: &Path, args: &[&str], replica: u32) -> PipelineResult<u32> {
        fs::create_dir_all(&self.log_dir)?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S%.6f");
        let log_path = self.log_dir.join(format!("Worker-{timestamp}-{replica}"));
        let log = File::create(&log_path)?;

        // dropping the fleet, even half-started, kills its workers
        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| PipelineError::fleet(format!("{} exited immediately", program.display())))?;
        info!(pid, replica, log = %log_path.display(), "Started local worker");

        self.children.push(child);
        Ok(pid)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().filter_map(Child::id).collect()
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Send SIGTERM to every local worker and reap them.
    pub async fn shutdown(&mut self) {
        for child in &mut self.children {
            let Some(pid) = child.id() else {
                continue;
            };
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                warn!(pid, "Failed to terminate worker: {}", e);
                continue;
            }
            match child.wait().await {
                Ok(status) => info!(pid, %status, "Worker stopped"),
                Err(e) => warn!(pid, "Failed to reap worker: {}", e),
            }
        }
        self.children.clear();
    }
}
