//! In-process broker.
//!
//! Behaves like the Redis broker (retry bound, dead-lettering, heartbeat
//! liveness, blocking reads) without a server. Used by tests and by
//! single-host runs that never leave the process.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{Broker, CompletionCursor, Delivery, QueueDepth, QueueState, RejectOutcome};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};

/// A job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub payload: String,
    pub reason: String,
}

/// A delivery and the consumer currently holding it.
struct Held {
    delivery: Delivery,
    consumer: String,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    work: VecDeque<Delivery>,
    in_flight: HashMap<String, Held>,
    completed: u64,
    dead: Vec<DeadLetter>,
    heartbeats: HashMap<String, Instant>,
    attempts: HashMap<String, u32>,
    closed: bool,
    published: Vec<String>,
    delivered: Vec<String>,
}

impl Inner {
    fn check_open(&self) -> QueueResult<()> {
        if self.closed {
            Err(QueueError::closed("memory broker closed"))
        } else {
            Ok(())
        }
    }

    /// Release a delivery; `false` when nobody held it any more.
    fn settle(&mut self, delivery: &Delivery) -> bool {
        self.in_flight.remove(&delivery.id).is_some()
    }

    fn is_live(&self, consumer: &str, ttl: Duration) -> bool {
        self.heartbeats
            .get(consumer)
            .is_some_and(|seen| seen.elapsed() < ttl)
    }

    fn enqueue(&mut self, payload: String) {
        self.next_id += 1;
        self.work.push_back(Delivery {
            id: format!("{}-0", self.next_id),
            payload,
        });
    }
}

/// In-process [`Broker`].
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
    heartbeat_ttl: Duration,
    max_attempts: u32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            heartbeat_ttl: config.heartbeat_ttl,
            max_attempts: config.max_attempts,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-operation
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Close the broker. Every later call fails with a non-recoverable error.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Every payload ever published, in order. Survives purges.
    pub fn published(&self) -> Vec<String> {
        self.lock().published.clone()
    }

    /// Every payload ever handed to a consumer, in order.
    pub fn delivered(&self) -> Vec<String> {
        self.lock().delivered.clone()
    }

    /// Payloads waiting in the work queue.
    pub fn pending(&self) -> Vec<String> {
        self.lock().work.iter().map(|d| d.payload.clone()).collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.clone()
    }

    pub fn completed(&self) -> u64 {
        self.lock().completed
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn live_consumers(inner: &Inner, ttl: Duration) -> u64 {
        let now = Instant::now();
        inner
            .heartbeats
            .values()
            .filter(|seen| now.duration_since(**seen) < ttl)
            .count() as u64
    }

    fn parse_cursor(cursor: &CompletionCursor) -> u64 {
        cursor
            .0
            .split('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> QueueResult<()> {
        self.lock().check_open()
    }

    async fn purge(&self) -> QueueResult<()> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.work.clear();
        inner.in_flight.clear();
        inner.completed = 0;
        Ok(())
    }

    async fn publish(&self, payload: &str) -> QueueResult<()> {
        {
            let mut inner = self.lock();
            inner.check_open()?;
            inner.published.push(payload.to_string());
            inner.enqueue(payload.to_string());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn state(&self) -> QueueResult<QueueState> {
        let inner = self.lock();
        inner.check_open()?;
        Ok(QueueState {
            work: QueueDepth {
                pending: inner.work.len() as u64,
                consumers: Self::live_consumers(&inner, self.heartbeat_ttl),
            },
            response: QueueDepth {
                pending: inner.completed,
                consumers: 0,
            },
            dead_lettered: inner.dead.len() as u64,
        })
    }

    async fn wait_for_completions(&self, cursor: &mut CompletionCursor, timeout: Duration) -> QueueResult<u64> {
        let deadline = Instant::now() + timeout;
        let seen = Self::parse_cursor(cursor);

        loop {
            let notified = self.notify.notified();
            {
                let inner = self.lock();
                inner.check_open()?;
                if inner.completed > seen {
                    cursor.0 = format!("{}-0", inner.completed);
                    return Ok(inner.completed - seen);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(0);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn heartbeat(&self, consumer: &str) -> QueueResult<()> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.heartbeats.insert(consumer.to_string(), Instant::now());
        Ok(())
    }

    async fn deregister(&self, consumer: &str) -> QueueResult<()> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.heartbeats.remove(consumer);
        Ok(())
    }

    async fn fetch(&self, consumer: &str, block: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + block;

        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                inner.check_open()?;
                if let Some(delivery) = inner.work.pop_front() {
                    inner.delivered.push(delivery.payload.clone());
                    inner.in_flight.insert(
                        delivery.id.clone(),
                        Held {
                            delivery: delivery.clone(),
                            consumer: consumer.to_string(),
                        },
                    );
                    return Ok(Some(delivery));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn claim_stale(&self, consumer: &str) -> QueueResult<Vec<Delivery>> {
        let mut inner = self.lock();
        inner.check_open()?;

        let orphaned: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, held)| held.consumer != consumer && !inner.is_live(&held.consumer, self.heartbeat_ttl))
            .map(|(id, _)| id.clone())
            .collect();

        let mut claimed = Vec::with_capacity(orphaned.len());
        for id in orphaned {
            if let Some(held) = inner.in_flight.get_mut(&id) {
                held.consumer = consumer.to_string();
                claimed.push(held.delivery.clone());
            }
        }
        for delivery in &claimed {
            inner.delivered.push(delivery.payload.clone());
        }
        Ok(claimed)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<bool> {
        {
            let mut inner = self.lock();
            inner.check_open()?;
            if !inner.settle(delivery) {
                return Ok(false);
            }
            inner.attempts.remove(&delivery.digest());
            inner.completed += 1;
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> QueueResult<RejectOutcome> {
        let outcome = {
            let mut inner = self.lock();
            inner.check_open()?;
            if !inner.settle(delivery) {
                return Ok(RejectOutcome::Stale);
            }

            let digest = delivery.digest();
            let attempts = {
                let counter = inner.attempts.entry(digest.clone()).or_insert(0);
                *counter += 1;
                *counter
            };

            if self.max_attempts > 0 && attempts >= self.max_attempts {
                inner.attempts.remove(&digest);
                inner.dead.push(DeadLetter {
                    payload: delivery.payload.clone(),
                    reason: reason.to_string(),
                });
                RejectOutcome::DeadLettered { attempts }
            } else {
                inner.enqueue(delivery.payload.clone());
                RejectOutcome::Requeued { attempts }
            }
        };
        self.notify.notify_waiters();
        Ok(outcome)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> QueueResult<bool> {
        let mut inner = self.lock();
        inner.check_open()?;
        if !inner.settle(delivery) {
            return Ok(false);
        }
        inner.attempts.remove(&delivery.digest());
        inner.dead.push(DeadLetter {
            payload: delivery.payload.clone(),
            reason: reason.to_string(),
        });
        Ok(true)
    }
}
