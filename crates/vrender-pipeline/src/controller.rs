//! Stage sequencing and drain cycles.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};
use vrender_queue::{Broker, CompletionCursor};
use vrender_storage::Storage;

use crate::bootstrap::BrokerBootstrap;
use crate::cache::CacheChecker;
use crate::config::{PipelineConfig, RenderConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::liveness::LivenessMonitor;
use crate::progress::StageProgress;
use crate::stages::{Dispatch, Stage};

/// Runs stages against a broker, one fully drained dispatch at a time.
pub struct Pipeline {
    broker: Arc<dyn Broker>,
    cache: CacheChecker,
    render: RenderConfig,
    settings: PipelineConfig,
    bootstrap: Option<BrokerBootstrap>,
}

impl Pipeline {
    pub fn new(broker: Arc<dyn Broker>, storage: Arc<Storage>, render: RenderConfig, settings: PipelineConfig) -> Self {
        Self {
            broker,
            cache: CacheChecker::new(storage),
            render,
            settings,
            bootstrap: None,
        }
    }

    /// Start a local broker whenever the configured one is unreachable.
    pub fn with_bootstrap(mut self, bootstrap: BrokerBootstrap) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn render_config(&self) -> &RenderConfig {
        &self.render
    }

    /// Run `stages` in order. Each stage finishes before the next starts.
    pub async fn run(&self, stages: &[Stage]) -> PipelineResult<()> {
        let started = Instant::now();
        for stage in stages {
            if let Some(bootstrap) = &self.bootstrap {
                bootstrap.ensure(self.broker.as_ref()).await?;
            }

            info!(stage = %stage, "Running stage");
            let mut dispatched = 0;
            for dispatch in stage.plan(&self.render)? {
                dispatched += self.run_halted_queue(&dispatch).await?;
            }
            info!(stage = %stage, jobs = dispatched, "Stage complete");
        }
        info!(elapsed_secs = started.elapsed().as_secs(), "Pipeline complete");
        Ok(())
    }

    /// Publish the uncached chunks of `dispatch` and block until all of them
    /// complete.
    ///
    /// Returns the number of jobs published. Fails when a job is
    /// dead-lettered or the fleet has no live workers for longer than the
    /// configured timeout.
    pub async fn run_halted_queue(&self, dispatch: &Dispatch) -> PipelineResult<u64> {
        let stage = dispatch.message.app.as_str();

        self.broker.purge().await?;
        let dead_baseline = self.broker.state().await?.dead_lettered;

        let chunks = self.cache.missing_chunks(&dispatch.message, &dispatch.chunks).await;
        if chunks.is_empty() {
            info!(stage, "All chunks cached, skipping");
            return Ok(0);
        }

        for chunk in &chunks {
            self.broker.publish_job(&dispatch.job(chunk)).await?;
        }
        let total = chunks.len() as u64;
        info!(stage, chunks = total, cached = dispatch.chunks.len() as u64 - total, "Dispatched");

        let progress = StageProgress::new(stage, total, self.settings.show_progress);
        match self.drain(stage, total, dead_baseline, &progress).await {
            Ok(()) => {
                progress.finish();
                Ok(total)
            }
            Err(e) => {
                progress.abandon();
                Err(e)
            }
        }
    }

    async fn drain(&self, stage: &str, total: u64, dead_baseline: u64, progress: &StageProgress) -> PipelineResult<()> {
        let mut monitor = LivenessMonitor::new(self.settings.no_worker_timeout);
        let mut cursor = CompletionCursor::start();

        loop {
            let state = self.broker.state().await?;
            let completed = state.completed();
            progress.update(completed, state.live_workers());

            let dead = state.dead_lettered.saturating_sub(dead_baseline);
            if dead > 0 {
                return Err(PipelineError::DeadLettered {
                    stage: stage.to_string(),
                    count: dead,
                });
            }
            if completed >= total {
                return Ok(());
            }

            let now = Instant::now();
            let was_empty = monitor.empty_for(now).is_some();
            if let Err(waited) = monitor.observe(state.live_workers(), true, now) {
                return Err(PipelineError::NoWorkers {
                    stage: stage.to_string(),
                    waited,
                });
            }
            if !was_empty && monitor.empty_for(now).is_some() {
                warn!(
                    stage,
                    timeout_secs = self.settings.no_worker_timeout.as_secs(),
                    "No live workers"
                );
            }

            self.broker
                .wait_for_completions(&mut cursor, self.settings.poll_interval)
                .await?;
        }
    }
}
