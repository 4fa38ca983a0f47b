//! Dead-fleet detection for the controller's wait loop.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks how long the worker fleet has been empty.
///
/// The timer starts the first time zero live workers are observed while work
/// is outstanding and resets as soon as any worker is seen again.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    timeout: Duration,
    zero_since: Option<Instant>,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            zero_since: None,
        }
    }

    /// Record one sample.
    ///
    /// Returns `Err(waited)` once the fleet has been empty for longer than the
    /// timeout.
    pub fn observe(&mut self, live_workers: u64, outstanding: bool, now: Instant) -> Result<(), Duration> {
        if live_workers > 0 || !outstanding {
            self.zero_since = None;
            return Ok(());
        }

        let since = *self.zero_since.get_or_insert(now);
        let waited = now.saturating_duration_since(since);
        if waited > self.timeout {
            Err(waited)
        } else {
            Ok(())
        }
    }

    /// How long the fleet has been empty, if it is.
    pub fn empty_for(&self, now: Instant) -> Option<Duration> {
        self.zero_since.map(|since| now.saturating_duration_since(since))
    }
}
