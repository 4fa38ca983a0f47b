//! Worker configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer name registered with the broker
    pub consumer_name: String,
    /// Parent of the per-job scratch roots
    pub scratch_dir: PathBuf,
    /// Directory holding the compute binaries
    pub bin_dir: PathBuf,
    /// Jobs handled at the same time
    pub prefetch: usize,
    /// How often the I/O task marks this worker alive
    pub heartbeat_interval: Duration,
    /// Longest single blocking fetch
    pub fetch_block: Duration,
    /// Pause before retrying after a recoverable broker error
    pub reconnect_delay: Duration,
    /// How long shutdown waits for in-flight jobs
    pub shutdown_timeout: Duration,
    /// Serve Prometheus metrics on this port
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("worker-{}", Uuid::new_v4()),
            scratch_dir: PathBuf::from("/tmp/vrender"),
            bin_dir: PathBuf::from("/usr/local/bin"),
            prefetch: 1,
            heartbeat_interval: Duration::from_secs(5),
            fetch_block: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            consumer_name: std::env::var("WORKER_NAME").unwrap_or(defaults.consumer_name),
            scratch_dir: std::env::var("WORKER_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            bin_dir: std::env::var("WORKER_BIN_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.bin_dir),
            prefetch: env_parse::<usize>("WORKER_PREFETCH")
                .map(|n| n.max(1))
                .unwrap_or(defaults.prefetch),
            heartbeat_interval: env_parse("WORKER_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            fetch_block: env_parse("WORKER_FETCH_BLOCK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch_block),
            reconnect_delay: env_parse("WORKER_RECONNECT_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_delay),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            metrics_port: env_parse("METRICS_PORT"),
        }
    }
}
