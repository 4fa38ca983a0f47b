//! Job executor.
//!
//! The executor loop owns every broker call: it fetches deliveries, hands
//! each to its stage handler on a separate task and settles the outcome the
//! task reports back (ack on success, reject on failure). Payloads that
//! cannot be dispatched at all go straight to the dead-letter queue. A
//! separate task keeps the worker's heartbeat fresh while jobs run.
//!
//! An unreachable broker never stops the worker: startup and every later
//! broker call retry recoverable errors until shutdown.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use vrender_models::JobMessage;
use vrender_queue::{Broker, Delivery, FailureTracker, RejectOutcome};
use vrender_storage::Storage;

use crate::config::WorkerConfig;
use crate::context::JobContext;
use crate::dispatch::{DispatchTable, StageHandler};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::rewrite::Scratch;
use crate::runner::BinaryRunner;

const MAX_LOGGED_FAILURES: u32 = 5;

/// State shared by every job task.
struct Shared {
    storage: Arc<Storage>,
    runner: Arc<BinaryRunner>,
    handlers: Arc<DispatchTable>,
    scratch_dir: PathBuf,
}

/// How a finished job must be settled with the broker.
#[derive(Debug)]
enum Settlement {
    Ack,
    Reject(String),
    DeadLetter(String),
}

/// Result of one job, sent from its task back to the executor loop.
struct JobOutcome {
    delivery: Delivery,
    stage: String,
    settlement: Settlement,
    /// Held until the outcome is settled so prefetch bounds unsettled jobs too
    _permit: OwnedSemaphorePermit,
}

/// Job executor that processes jobs from the broker.
pub struct JobExecutor {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    shared: Arc<Shared>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        storage: Arc<Storage>,
        handlers: DispatchTable,
    ) -> Self {
        let prefetch = config.prefetch.max(1);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            storage,
            runner: Arc::new(BinaryRunner::new(config.bin_dir.clone())),
            handlers: Arc::new(handlers),
            scratch_dir: config.scratch_dir.clone(),
        });

        Self {
            config,
            broker,
            shared,
            job_semaphore: Arc::new(Semaphore::new(prefetch)),
            shutdown,
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Consume jobs until shutdown or a non-recoverable broker error.
    pub async fn run(&self) -> WorkerResult<()> {
        let name = self.config.consumer_name.clone();
        info!(
            "Starting job executor '{}' with prefetch {}",
            name,
            self.config.prefetch.max(1)
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        if !self.connect(&mut shutdown_rx).await? {
            info!("Shutdown before the broker was reachable");
            return Ok(());
        }
        let heartbeat_task = self.spawn_heartbeat();

        let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();
        let mut backlog = VecDeque::new();
        let mut failures = FailureTracker::new(MAX_LOGGED_FAILURES);
        let mut fatal = None;

        while !*shutdown_rx.borrow() {
            let step = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                Some(outcome) = outcomes.recv() => self.settle(outcome).await,
                // only the permit wait is raced; a started fetch always completes
                permit = Arc::clone(&self.job_semaphore).acquire_owned() => match permit {
                    Ok(permit) => self.consume(permit, &mut backlog, &outcome_tx).await,
                    Err(_) => Err(WorkerError::job_failed("Semaphore closed")),
                },
            };

            match step {
                Ok(()) => failures.record_success(),
                Err(e) if e.is_recoverable() => {
                    if failures.record_failure() {
                        warn!("Broker unavailable, retrying in {:?}: {}", self.config.reconnect_delay, e);
                    }
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
                Err(e) => {
                    error!("Error consuming jobs: {}", e);
                    fatal = Some(e);
                    break;
                }
            }
        }
        info!("Shutdown signal received, stopping executor");

        // jobs still running settle as they finish; the channel closes with the last one
        drop(outcome_tx);
        info!("Waiting for in-flight jobs to complete...");
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(outcome) = outcomes.recv().await {
                if let Err(e) = self.settle(outcome).await {
                    error!("Failed to settle job during shutdown: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("In-flight jobs still running after {:?}", self.config.shutdown_timeout);
        }

        self.shutdown();
        let _ = heartbeat_task.await;
        if let Err(e) = self.broker.deregister(&name).await {
            warn!("Failed to deregister '{}': {}", name, e);
        }

        info!("Job executor stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Prepare the queues and register this worker, retrying until the broker
    /// answers. Returns `false` when shutdown came first.
    async fn connect(&self, shutdown_rx: &mut watch::Receiver<bool>) -> WorkerResult<bool> {
        let name = &self.config.consumer_name;
        let mut failures = FailureTracker::new(MAX_LOGGED_FAILURES);

        loop {
            if *shutdown_rx.borrow() {
                return Ok(false);
            }
            let attempt = async {
                self.broker.init().await?;
                self.broker.heartbeat(name).await
            };
            match attempt.await {
                Ok(()) => {
                    info!("Registered '{}' with the broker", name);
                    return Ok(true);
                }
                Err(e) if e.is_recoverable() => {
                    if failures.record_failure() {
                        warn!("Broker unreachable at startup, retrying in {:?}: {}", self.config.reconnect_delay, e);
                    }
                }
                Err(e) => {
                    error!("Cannot register with the broker: {}", e);
                    return Err(e.into());
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let name = self.config.consumer_name.clone();
        let period = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut failures = FailureTracker::new(MAX_LOGGED_FAILURES);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => match broker.heartbeat(&name).await {
                        Ok(()) => failures.record_success(),
                        Err(e) => {
                            if failures.record_failure() {
                                warn!("Heartbeat failed: {}", e);
                            }
                        }
                    }
                }
            }
        })
    }

    /// Take one delivery and start it. Idle polls re-claim abandoned deliveries.
    async fn consume(
        &self,
        permit: OwnedSemaphorePermit,
        backlog: &mut VecDeque<Delivery>,
        outcome_tx: &mpsc::UnboundedSender<JobOutcome>,
    ) -> WorkerResult<()> {
        let delivery = match backlog.pop_front() {
            Some(delivery) => delivery,
            None => match self
                .broker
                .fetch(&self.config.consumer_name, self.config.fetch_block)
                .await?
            {
                Some(delivery) => delivery,
                None => {
                    let claimed = self.broker.claim_stale(&self.config.consumer_name).await?;
                    if !claimed.is_empty() {
                        info!("Claimed {} stale deliveries", claimed.len());
                    }
                    backlog.extend(claimed);
                    return Ok(());
                }
            },
        };

        debug!(delivery = %delivery.id, "Fetched delivery");
        let shared = Arc::clone(&self.shared);
        let outcome_tx = outcome_tx.clone();
        tokio::spawn(async move {
            let (stage, settlement) = Self::execute_job(shared, &delivery).await;
            let _ = outcome_tx.send(JobOutcome {
                delivery,
                stage,
                settlement,
                _permit: permit,
            });
        });
        Ok(())
    }

    /// Run one delivery; returns its stage label and how to settle it.
    async fn execute_job(shared: Arc<Shared>, delivery: &Delivery) -> (String, Settlement) {
        let msg = match JobMessage::from_json(&delivery.payload) {
            Ok(msg) => msg,
            Err(e) => {
                return (
                    "unparseable".to_string(),
                    Settlement::DeadLetter(format!("Malformed payload: {e}")),
                )
            }
        };
        let handler = match shared.handlers.lookup(&msg.app) {
            Ok(handler) => handler,
            Err(e) => return (msg.app, Settlement::DeadLetter(e.to_string())),
        };

        let stage = handler.kind().app_name().to_string();
        metrics::record_job_started(&stage);
        let started = Instant::now();

        // panics inside the handler surface as a join error instead of killing the worker
        let task = tokio::spawn(Self::process_job(shared, handler, msg, delivery.id.clone()));
        let result = task
            .await
            .unwrap_or_else(|e| Err(WorkerError::job_failed(format!("Handler panicked: {e}"))));

        match result {
            Ok(()) => {
                metrics::record_job_succeeded(&stage, started.elapsed().as_secs_f64());
                (stage, Settlement::Ack)
            }
            Err(e) => {
                metrics::record_job_failed(&stage);
                (stage, Settlement::Reject(e.to_string()))
            }
        }
    }

    async fn process_job(
        shared: Arc<Shared>,
        handler: Arc<dyn StageHandler>,
        msg: JobMessage,
        job_id: String,
    ) -> WorkerResult<()> {
        let logger = JobLogger::new(&job_id, &msg);
        let span = logger.span();

        async move {
            logger.started();
            let scratch = Scratch::new(&shared.scratch_dir);
            let roots = scratch.roots_for(&shared.storage, &msg)?;
            let ctx = JobContext::new(
                msg,
                handler.kind(),
                Arc::clone(&shared.storage),
                Arc::clone(&shared.runner),
                roots,
                logger,
            );

            let result = handler.handle(&ctx).await;
            scratch.cleanup().await;
            ctx.logger.finished(&result);
            result
        }
        .instrument(span)
        .await
    }

    /// Report a finished job to the broker.
    async fn settle(&self, outcome: JobOutcome) -> WorkerResult<()> {
        let JobOutcome {
            delivery,
            stage,
            settlement,
            ..
        } = outcome;

        match settlement {
            Settlement::Ack => {
                if !self.broker.ack(&delivery).await? {
                    warn!(delivery = %delivery.id, "Job finished but was already settled elsewhere");
                }
            }
            Settlement::Reject(reason) => match self.broker.reject(&delivery, &reason).await? {
                RejectOutcome::Requeued { attempts } => {
                    warn!(delivery = %delivery.id, attempts, "Job failed, republished: {}", reason);
                }
                RejectOutcome::DeadLettered { attempts } => {
                    error!(delivery = %delivery.id, attempts, "Job failed for the last time, dead-lettered: {}", reason);
                    metrics::record_job_dead_lettered(&stage);
                }
                RejectOutcome::Stale => {
                    warn!(delivery = %delivery.id, "Job failed but was already settled elsewhere: {}", reason);
                }
            },
            Settlement::DeadLetter(reason) => {
                error!(delivery = %delivery.id, "Cannot dispatch job, dead-lettering: {}", reason);
                if self.broker.dead_letter(&delivery, &reason).await? {
                    metrics::record_job_dead_lettered(&stage);
                }
            }
        }
        Ok(())
    }
}
