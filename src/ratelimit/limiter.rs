//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::store::{Admission, SweepReport, WindowStore};
use crate::config::LimiterConfig;
use crate::error::{GatekeeperError, Result};

/// Decision for one request, with the hint the caller should pass on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Verdict {
    /// Proceed; `remaining` more requests fit in the current window.
    Allowed { remaining: u64 },
    /// Answer "too many requests" and ask the client to retry later.
    Denied { retry_after_secs: u64 },
}

impl Verdict {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }
}

/// Sliding window admission control for one policy.
///
/// At most `limit` requests per key are admitted in any trailing `window`.
/// The limiter owns its [`WindowStore`]; two limiters never share state.
/// It is safe to call from any number of tasks or threads at once.
#[derive(Debug)]
pub struct Limiter {
    /// Maximum admissions per key within one window
    limit: u64,
    /// Trailing window length
    window: Duration,
    /// Per-key activity, shared only with this limiter's cleanup task
    store: Arc<WindowStore>,
    clock: Arc<dyn Clock>,
    /// Cancels the running cleanup task, if any
    cleanup: Mutex<Option<CancellationToken>>,
}

impl Limiter {
    /// Create a limiter admitting `limit` requests per key in any `window`.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    /// Create a limiter that reads time from `clock`.
    pub fn with_clock(limit: u64, window: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if limit == 0 {
            return Err(GatekeeperError::Config(
                "limit must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(GatekeeperError::Config(
                "window must be longer than zero".to_string(),
            ));
        }

        info!(
            limit,
            window_ms = window.as_millis() as u64,
            "Creating sliding window limiter"
        );

        Ok(Self {
            limit,
            window,
            store: Arc::new(WindowStore::new()),
            clock,
            cleanup: Mutex::new(None),
        })
    }

    /// Create a limiter from the `limiter` section of the configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        Self::new(config.limit, config.window())
    }

    /// Decide whether a request from `key` may proceed, recording it if so.
    pub fn allow(&self, key: &str) -> bool {
        let allowed = self
            .store
            .check_and_record(key, self.clock.now(), self.limit, self.window);

        trace!(key, allowed, "Checked admission");
        if !allowed {
            debug!(key, limit = self.limit, "Rate limit exceeded");
        }
        allowed
    }

    /// Like [`allow`](Self::allow), returning the quota left or the retry hint.
    pub fn check(&self, key: &str) -> Verdict {
        match self
            .store
            .admit(key, self.clock.now(), self.limit, self.window)
        {
            Admission::Admitted { remaining } => {
                trace!(key, remaining, "Request admitted");
                Verdict::Allowed { remaining }
            }
            Admission::Rejected => {
                debug!(key, limit = self.limit, "Rate limit exceeded");
                Verdict::Denied {
                    retry_after_secs: self.retry_after_secs(),
                }
            }
        }
    }

    /// Requests `key` could still make right now, without recording anything.
    pub fn remaining(&self, key: &str) -> u64 {
        let active = self.store.active_count(key, self.clock.now()) as u64;
        self.limit.saturating_sub(active)
    }

    /// Retry hint for denied requests: the window in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.window.as_secs() + u64::from(self.window.subsec_nanos() > 0);
        secs.max(1)
    }

    /// Run one sweep now, evicting keys that have been idle for a full window.
    pub fn sweep(&self) -> SweepReport {
        self.store.sweep(self.clock.now())
    }

    /// Start sweeping every `interval` on the current Tokio runtime.
    ///
    /// Does nothing if a cleanup task is already running. The task stops on
    /// [`stop_cleanup`](Self::stop_cleanup) or when the limiter is dropped.
    pub fn start_cleanup(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(GatekeeperError::Config(
                "cleanup interval must be longer than zero".to_string(),
            ));
        }

        let mut slot = self.cleanup.lock();
        if slot.as_ref().is_some_and(|cancel| !cancel.is_cancelled()) {
            warn!("Cleanup task already running, ignoring start request");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GatekeeperError::Runtime(e.to_string()))?;

        let cancel = CancellationToken::new();
        runtime.spawn(run_cleanup_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            interval,
            cancel.clone(),
        ));
        *slot = Some(cancel);

        Ok(())
    }

    /// Stop the cleanup task. Returns whether one was running.
    pub fn stop_cleanup(&self) -> bool {
        match self.cleanup.lock().take() {
            Some(cancel) => {
                let was_running = !cancel.is_cancelled();
                cancel.cancel();
                was_running
            }
            None => false,
        }
    }

    /// Admissions allowed per key within one window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of keys currently held in memory.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        if let Some(cancel) = self.cleanup.get_mut().take() {
            cancel.cancel();
        }
    }
}

/// Sweep `store` on every tick until `cancel` fires.
async fn run_cleanup_loop(
    store: Arc<WindowStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_ms = interval.as_millis() as u64,
        "Cleanup task started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Cleanup task shutting down");
                break;
            }
            _ = ticker.tick() => {
                let report = store.sweep(clock.now());
                if report.keys_removed > 0 {
                    debug!(
                        keys_scanned = report.keys_scanned,
                        keys_removed = report.keys_removed,
                        timestamps_pruned = report.timestamps_pruned,
                        remaining = store.len(),
                        "Sweep evicted idle keys"
                    );
                } else {
                    trace!(keys_scanned = report.keys_scanned, "Sweep found no idle keys");
                }
            }
        }
    }
}
