//! Observability counters shared by every guard component.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters describing admission, breaker, lock, rollback and transaction activity.
///
/// Cloning is cheap and every clone updates the same counters, so one handle
/// is created per `MutationGuard` and passed to each component.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_admitted: AtomicU64,
    requests_denied: AtomicU64,
    breaker_rejections: AtomicU64,
    breaker_trips: AtomicU64,
    locks_acquired: AtomicU64,
    lock_timeouts: AtomicU64,
    stale_locks_released: AtomicU64,
    rollbacks_created: AtomicU64,
    rollbacks_executed: AtomicU64,
    rollbacks_expired: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    transactions_failed: AtomicU64,
    transactions_swept: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $read:ident, $field:ident) => {
        pub(crate) fn $record(&self) {
            self.inner.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[doc = concat!("Current value of `", stringify!($field), "`.")]
        pub fn $read(&self) -> u64 {
            self.inner.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    /// Create a fresh set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_admitted, requests_admitted, requests_admitted);
    counter!(record_denied, requests_denied, requests_denied);
    counter!(record_breaker_rejection, breaker_rejections, breaker_rejections);
    counter!(record_breaker_trip, breaker_trips, breaker_trips);
    counter!(record_lock_acquired, locks_acquired, locks_acquired);
    counter!(record_lock_timeout, lock_timeouts, lock_timeouts);
    counter!(record_stale_lock, stale_locks_released, stale_locks_released);
    counter!(record_rollback_created, rollbacks_created, rollbacks_created);
    counter!(record_rollback_executed, rollbacks_executed, rollbacks_executed);
    counter!(record_committed, transactions_committed, transactions_committed);
    counter!(record_rolled_back, transactions_rolled_back, transactions_rolled_back);
    counter!(record_tx_failed, transactions_failed, transactions_failed);
    counter!(record_tx_swept, transactions_swept, transactions_swept);

    /// Record several expired rollback records at once.
    pub(crate) fn record_rollbacks_expired(&self, count: u64) {
        self.inner
            .rollbacks_expired
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Current value of `rollbacks_expired`.
    pub fn rollbacks_expired(&self) -> u64 {
        self.inner.rollbacks_expired.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_admitted: self.requests_admitted(),
            requests_denied: self.requests_denied(),
            breaker_rejections: self.breaker_rejections(),
            breaker_trips: self.breaker_trips(),
            locks_acquired: self.locks_acquired(),
            lock_timeouts: self.lock_timeouts(),
            stale_locks_released: self.stale_locks_released(),
            rollbacks_created: self.rollbacks_created(),
            rollbacks_executed: self.rollbacks_executed(),
            rollbacks_expired: self.rollbacks_expired(),
            transactions_committed: self.transactions_committed(),
            transactions_rolled_back: self.transactions_rolled_back(),
            transactions_failed: self.transactions_failed(),
            transactions_swept: self.transactions_swept(),
        }
    }
}

/// A point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Requests admitted by rate limiters
    pub requests_admitted: u64,
    /// Requests denied by rate limiters
    pub requests_denied: u64,
    /// Calls rejected without invoking the dependency
    pub breaker_rejections: u64,
    /// Transitions into the open state
    pub breaker_trips: u64,
    /// Successful lock/semaphore acquisitions
    pub locks_acquired: u64,
    /// Acquisitions that timed out
    pub lock_timeouts: u64,
    /// Holders force-released as possible deadlocks
    pub stale_locks_released: u64,
    /// Rollback records created
    pub rollbacks_created: u64,
    /// Rollback records executed
    pub rollbacks_executed: u64,
    /// Rollback records removed after expiry
    pub rollbacks_expired: u64,
    /// Transactions committed or applied
    pub transactions_committed: u64,
    /// Transactions rolled back
    pub transactions_rolled_back: u64,
    /// Transactions the executor could not apply
    pub transactions_failed: u64,
    /// Transactions rolled back by the stale sweep
    pub transactions_swept: u64,
}

impl MetricsSnapshot {
    /// Ratio of denied to total admission checks (0.0 when idle).
    pub fn denial_rate(&self) -> f64 {
        let total = self.requests_admitted.saturating_add(self.requests_denied);
        if total == 0 {
            0.0
        } else {
            self.requests_denied as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_initial_state() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.snapshot().denial_rate(), 0.0);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();

        clone.record_admitted();
        clone.record_admitted();
        clone.record_admitted();
        metrics.record_denied();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_admitted, 3);
        assert_eq!(snapshot.requests_denied, 1);
        assert!((snapshot.denial_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bulk_expiry_counter() {
        let metrics = Metrics::new();
        metrics.record_rollbacks_expired(4);
        metrics.record_rollbacks_expired(1);
        assert_eq!(metrics.rollbacks_expired(), 5);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Metrics::new();
        let mut handles = vec![];

        for _ in 0..10 {
            let metrics = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    metrics.record_lock_acquired();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.locks_acquired(), 1000);
    }
}
