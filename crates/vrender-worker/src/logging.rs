//! Per-job tracing.
//!
//! A [`JobLogger`] is built once per delivery and tags every event of that
//! job with the delivery id, the stage identifier and the frame range.

use std::time::Instant;

use tracing::{error, info, Span};

use vrender_models::{FrameName, JobMessage};

use crate::error::WorkerResult;

#[derive(Debug, Clone)]
pub struct JobLogger {
    delivery: String,
    app: String,
    first: FrameName,
    last: FrameName,
    started: Instant,
}

impl JobLogger {
    pub fn new(delivery: &str, msg: &JobMessage) -> Self {
        Self {
            delivery: delivery.to_string(),
            app: msg.app.clone(),
            first: msg.first.clone(),
            last: msg.last.clone(),
            started: Instant::now(),
        }
    }

    /// Span wrapping everything a handler does for this job.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "job",
            delivery = %self.delivery,
            app = %self.app,
            frames = %self.frames()
        )
    }

    pub fn started(&self) {
        info!(delivery = %self.delivery, app = %self.app, "Job started: frames {}", self.frames());
    }

    pub fn binary_started(&self, binary: &str) {
        info!(delivery = %self.delivery, binary, "Running {}", binary);
    }

    /// Log how the job ended and how long it took.
    pub fn finished(&self, result: &WorkerResult<()>) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => info!(
                delivery = %self.delivery,
                app = %self.app,
                elapsed_ms,
                "Job finished: frames {}", self.frames()
            ),
            Err(e) => error!(
                delivery = %self.delivery,
                app = %self.app,
                elapsed_ms,
                "Job failed: frames {}: {}", self.frames(), e
            ),
        }
    }

    fn frames(&self) -> String {
        if self.first == self.last {
            self.first.to_string()
        } else {
            format!("{}-{}", self.first, self.last)
        }
    }
}
