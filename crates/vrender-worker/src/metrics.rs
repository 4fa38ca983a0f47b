//! Prometheus metrics for the worker.

use std::net::{Ipv4Addr, SocketAddrV4};

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "vrender_jobs_started_total";
    pub const JOBS_SUCCEEDED_TOTAL: &str = "vrender_jobs_succeeded_total";
    pub const JOBS_FAILED_TOTAL: &str = "vrender_jobs_failed_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "vrender_jobs_dead_lettered_total";
    pub const JOB_DURATION_SECONDS: &str = "vrender_job_duration_seconds";
    pub const BINARY_DURATION_SECONDS: &str = "vrender_binary_duration_seconds";
}

/// Serve metrics on `0.0.0.0:<port>/metrics`.
pub fn install_exporter(port: u16) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {e}")))
}

pub fn record_job_started(stage: &str) {
    let labels = [("stage", stage.to_string())];
    counter!(names::JOBS_STARTED_TOTAL, &labels).increment(1);
}

pub fn record_job_succeeded(stage: &str, duration_secs: f64) {
    let labels = [("stage", stage.to_string())];
    counter!(names::JOBS_SUCCEEDED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_job_failed(stage: &str) {
    let labels = [("stage", stage.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_dead_lettered(stage: &str) {
    let labels = [("stage", stage.to_string())];
    counter!(names::JOBS_DEAD_LETTERED_TOTAL, &labels).increment(1);
}

pub fn record_binary_duration(binary: &str, duration_secs: f64) {
    let labels = [("binary", binary.to_string())];
    histogram!(names::BINARY_DURATION_SECONDS, &labels).record(duration_secs);
}
