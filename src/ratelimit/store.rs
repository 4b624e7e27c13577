//! Per-key activity logs backing the sliding window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Recent admissions for one identity key.
#[derive(Debug)]
struct ActivityLog {
    /// Admission instants, non-decreasing front to back
    timestamps: VecDeque<Instant>,
    /// Window this log was last checked against; the sweep prunes with it
    window: Duration,
}

impl ActivityLog {
    fn new(window: Duration) -> Self {
        Self {
            timestamps: VecDeque::new(),
            window,
        }
    }

    /// Earliest instant still inside the window ending at `now`.
    ///
    /// `None` when the window reaches back past the clock's representable
    /// range, in which case nothing can have expired yet.
    fn horizon(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.window)
    }

    /// Drop timestamps older than `now - window`. Returns how many were dropped.
    fn prune(&mut self, now: Instant) -> usize {
        let Some(horizon) = self.horizon(now) else {
            return 0;
        };

        let before = self.timestamps.len();
        while self.timestamps.front().is_some_and(|t| *t < horizon) {
            self.timestamps.pop_front();
        }
        before - self.timestamps.len()
    }

    /// Count timestamps inside the window ending at `now` without mutating.
    fn active(&self, now: Instant) -> usize {
        match self.horizon(now) {
            Some(horizon) => self.timestamps.iter().filter(|t| **t >= horizon).count(),
            None => self.timestamps.len(),
        }
    }

    fn record(&mut self, now: Instant) {
        // A caller that read the clock before a concurrent caller for the same
        // key may arrive second; clamp so the log stays ordered.
        let stamp = match self.timestamps.back() {
            Some(last) if *last > now => *last,
            _ => now,
        };
        self.timestamps.push_back(stamp);
    }

    fn len(&self) -> usize {
        self.timestamps.len()
    }

    fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Outcome of a single check-and-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request was recorded; `remaining` more fit in the current window.
    Admitted { remaining: u64 },
    /// The window is full; nothing was recorded.
    Rejected,
}

impl Admission {
    /// Whether the request was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// What a sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys visited
    pub keys_scanned: usize,
    /// Keys removed because their log drained
    pub keys_removed: usize,
    /// Expired timestamps dropped across all keys
    pub timestamps_pruned: usize,
}

/// Thread-safe mapping from identity key to its recent activity.
///
/// The map is sharded by key hash. A check-and-record holds the lock of one
/// shard for the duration of the prune, compare and append, so decisions for
/// a single key are linearizable while unrelated keys on other shards proceed
/// in parallel.
#[derive(Debug, Default)]
pub struct WindowStore {
    logs: DashMap<String, ActivityLog>,
}

impl WindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
        }
    }

    /// Atomically prune, count and, if there is room, record `now` for `key`.
    ///
    /// Returns `true` when the request was admitted. Expired timestamps are
    /// pruned whether or not the request is admitted.
    pub fn check_and_record(&self, key: &str, now: Instant, limit: u64, window: Duration) -> bool {
        self.admit(key, now, limit, window).is_admitted()
    }

    /// Same critical section as [`check_and_record`](Self::check_and_record),
    /// also reporting the quota left after an admission.
    pub fn admit(&self, key: &str, now: Instant, limit: u64, window: Duration) -> Admission {
        debug_assert!(limit > 0, "admission limit must be positive");
        debug_assert!(!window.is_zero(), "admission window must be positive");

        if limit == 0 {
            return Admission::Rejected;
        }

        let mut log = match self.logs.get_mut(key) {
            Some(log) => log,
            None => self
                .logs
                .entry(key.to_owned())
                .or_insert_with(|| ActivityLog::new(window)),
        };

        log.window = window;
        log.prune(now);

        let active = log.len() as u64;
        if active >= limit {
            return Admission::Rejected;
        }

        log.record(now);
        Admission::Admitted {
            remaining: limit - active - 1,
        }
    }

    /// Prune every key against its last-known window and drop keys that drain.
    ///
    /// Shards are locked one at a time, so concurrent admissions for keys on
    /// other shards are not held up by the traversal.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        self.logs.retain(|_, log| {
            report.keys_scanned += 1;
            report.timestamps_pruned += log.prune(now);
            if log.is_empty() {
                report.keys_removed += 1;
                false
            } else {
                true
            }
        });

        report
    }

    /// Timestamps for `key` still inside its window at `now`.
    pub fn active_count(&self, key: &str, now: Instant) -> usize {
        self.logs.get(key).map_or(0, |log| log.active(now))
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Whether `key` has a log.
    pub fn contains_key(&self, key: &str) -> bool {
        self.logs.contains_key(key)
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.logs.clear();
    }

    #[cfg(test)]
    fn stored_len(&self, key: &str) -> usize {
        self.logs.get(key).map_or(0, |log| log.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    const WINDOW: Duration = Duration::from_secs(10);

    fn at(origin: Instant, secs: u64) -> Instant {
        origin + Duration::from_secs(secs)
    }

    #[test]
    fn test_three_per_ten_seconds_scenario() {
        let store = WindowStore::new();
        let t0 = Instant::now();
        let key = "1.2.3.4";

        assert!(store.check_and_record(key, at(t0, 0), 3, WINDOW));
        assert!(store.check_and_record(key, at(t0, 1), 3, WINDOW));
        assert!(store.check_and_record(key, at(t0, 2), 3, WINDOW));
        assert!(!store.check_and_record(key, at(t0, 3), 3, WINDOW));

        // t=0 has aged out; t=1 and t=2 are still inside [1, 11]
        assert!(store.check_and_record(key, at(t0, 11), 3, WINDOW));
        assert!(!store.check_and_record(key, at(t0, 11), 3, WINDOW));
    }

    #[test]
    fn test_rejection_does_not_record() {
        let store = WindowStore::new();
        let t0 = Instant::now();

        assert!(store.check_and_record("k", t0, 1, WINDOW));
        for secs in 1..5 {
            assert!(!store.check_and_record("k", at(t0, secs), 1, WINDOW));
        }
        assert_eq!(store.stored_len("k"), 1);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let store = WindowStore::new();
        let t0 = Instant::now();
        let epsilon = Duration::from_millis(1);

        assert!(store.check_and_record("k", t0, 1, WINDOW));
        assert!(!store.check_and_record("k", t0 + WINDOW - epsilon, 1, WINDOW));
        assert!(!store.check_and_record("k", t0 + WINDOW, 1, WINDOW));
        assert!(store.check_and_record("k", t0 + WINDOW + epsilon, 1, WINDOW));
    }

    #[test]
    fn test_keys_are_independent() {
        let store = WindowStore::new();
        let t0 = Instant::now();

        for _ in 0..2 {
            assert!(store.check_and_record("a", t0, 2, WINDOW));
        }
        assert!(!store.check_and_record("a", t0, 2, WINDOW));

        for _ in 0..2 {
            assert!(store.check_and_record("b", t0, 2, WINDOW));
        }
        assert!(!store.check_and_record("b", t0, 2, WINDOW));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_admit_reports_remaining() {
        let store = WindowStore::new();
        let t0 = Instant::now();

        assert_eq!(store.admit("k", t0, 3, WINDOW), Admission::Admitted { remaining: 2 });
        assert_eq!(store.admit("k", t0, 3, WINDOW), Admission::Admitted { remaining: 1 });
        assert_eq!(store.admit("k", t0, 3, WINDOW), Admission::Admitted { remaining: 0 });
        assert_eq!(store.admit("k", t0, 3, WINDOW), Admission::Rejected);
    }

    #[test]
    fn test_prune_happens_on_rejection() {
        let store = WindowStore::new();
        let t0 = Instant::now();

        for secs in [0, 5, 6] {
            assert!(store.check_and_record("k", at(t0, secs), 3, WINDOW));
        }
        assert_eq!(store.stored_len("k"), 3);

        // A tighter policy rejects, but still drops t=0 which is outside it
        assert!(!store.check_and_record("k", at(t0, 8), 2, Duration::from_secs(5)));
        assert_eq!(store.stored_len("k"), 2);
    }

    #[test]
    fn test_out_of_order_now_keeps_log_ordered() {
        let store = WindowStore::new();
        let t0 = Instant::now();

        assert!(store.check_and_record("k", at(t0, 5), 3, WINDOW));
        assert!(store.check_and_record("k", at(t0, 4), 3, WINDOW));

        // Both entries expire together once t=5 leaves the window
        assert_eq!(store.active_count("k", at(t0, 15)), 2);
        assert_eq!(store.active_count("k", at(t0, 16)), 0);
    }

    #[test]
    fn test_active_count_does_not_mutate() {
        let store = WindowStore::new();
        let t0 = Instant::now();

        store.check_and_record("k", t0, 5, WINDOW);
        store.check_and_record("k", at(t0, 3), 5, WINDOW);

        assert_eq!(store.active_count("k", at(t0, 12)), 1);
        assert_eq!(store.stored_len("k"), 2);
        assert_eq!(store.active_count("missing", t0), 0);
    }

    #[test]
    fn test_sweep_removes_idle_keys() {
        let store = WindowStore::new();
        let t0 = Instant::now();

        store.check_and_record("idle", t0, 5, WINDOW);
        store.check_and_record("idle", at(t0, 1), 5, WINDOW);
        store.check_and_record("busy", at(t0, 8), 5, WINDOW);
        assert_eq!(store.len(), 2);

        let report = store.sweep(at(t0, 12));

        assert_eq!(
            report,
            SweepReport {
                keys_scanned: 2,
                keys_removed: 1,
                timestamps_pruned: 2,
            }
        );
        assert!(!store.contains_key("idle"));
        assert!(store.contains_key("busy"));

        let report = store.sweep(at(t0, 30));
        assert_eq!(report.keys_removed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_uses_each_keys_window() {
        let store = WindowStore::new();
        let t0 = Instant::now();

        store.check_and_record("short", t0, 5, Duration::from_secs(5));
        store.check_and_record("long", t0, 5, Duration::from_secs(50));

        store.sweep(at(t0, 10));

        assert!(!store.contains_key("short"));
        assert!(store.contains_key("long"));
    }

    #[test]
    fn test_swept_key_restarts_cleanly() {
        let store = WindowStore::new();
        let t0 = Instant::now();

        assert!(store.check_and_record("k", t0, 1, WINDOW));
        store.sweep(at(t0, 20));
        assert!(!store.contains_key("k"));

        assert!(store.check_and_record("k", at(t0, 20), 1, WINDOW));
        assert!(!store.check_and_record("k", at(t0, 21), 1, WINDOW));
    }

    #[test]
    fn test_clear() {
        let store = WindowStore::new();
        store.check_and_record("k", Instant::now(), 1, WINDOW);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_same_key_never_exceeds_limit() {
        let store = Arc::new(WindowStore::new());
        let now = Instant::now();
        let admitted = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    for _ in 0..100 {
                        if store.check_and_record("shared", now, 50, WINDOW) {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 50);
        assert_eq!(store.stored_len("shared"), 50);
    }

    #[test]
    fn test_sweep_concurrent_with_admissions() {
        const STEPS: u64 = 64;
        const WORKERS: usize = 4;
        const KEYS_PER_WORKER: usize = 4;
        const LIMIT: u64 = 2;
        // Steps per window; a timestamp `WINDOW_STEPS` old is still inside it
        const WINDOW_STEPS: u64 = 4;

        let store = Arc::new(WindowStore::new());
        let origin = Instant::now();
        let step = WINDOW / WINDOW_STEPS as u32;
        let at_step = move |s: u64| origin + step * s as u32;
        // Workers and the sweeper agree on the current step; sweeping step `s`
        // overlaps the workers' admissions at step `s + 1`
        let barrier = Arc::new(Barrier::new(WORKERS + 1));

        let workers: Vec<_> = (0..WORKERS)
            .map(|w| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let keys: Vec<String> = (0..KEYS_PER_WORKER)
                        .map(|k| format!("10.{}.0.{}", w, k))
                        .collect();
                    let mut admitted: Vec<Vec<u64>> = vec![Vec::new(); KEYS_PER_WORKER];

                    for s in 0..STEPS {
                        for (k, key) in keys.iter().enumerate() {
                            // Alternate busy and idle stretches of eight steps
                            if (s / 8) % 2 != k as u64 % 2 {
                                continue;
                            }
                            if store.check_and_record(key, at_step(s), LIMIT, WINDOW) {
                                admitted[k].push(s);
                            }
                        }
                        barrier.wait();
                    }

                    admitted
                })
            })
            .collect();

        let sweeper = {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut removed = 0;
                for s in 0..STEPS {
                    barrier.wait();
                    removed += store.sweep(at_step(s)).keys_removed;
                }
                removed
            })
        };

        let admitted: Vec<Vec<u64>> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();
        let removed = sweeper.join().unwrap();

        for steps in &admitted {
            assert!(!steps.is_empty());
            // No window ever holds more than the limit
            for span in steps.windows(LIMIT as usize + 1) {
                assert!(
                    span[LIMIT as usize] - span[0] > WINDOW_STEPS,
                    "{:?} admitted within one window",
                    span
                );
            }
            // Admitted again after the idle stretch that evicted it
            assert!(*steps.last().unwrap() >= 16);
        }

        // Every key idles for longer than a window at least once
        assert!(removed >= WORKERS * KEYS_PER_WORKER);
    }
}
