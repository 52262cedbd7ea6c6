//! Admission control per `subject:operation` key.
//!
//! A [`RateLimiter`] applies one [`RateLimitConfig`] to many keys. The
//! [`RateLimiterRegistry`] owns one limiter per operation class and creates
//! it lazily on first reference.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Storage};
use crate::domain::rate_limit::{Admission, KeyWindow, RateLimitConfig};
use crate::infrastructure::storage::ShardedStorage;

/// Default storage for per-key windows.
pub type WindowStorage = Arc<ShardedStorage<String, KeyWindow>>;

/// Build the limiter key for a subject performing an operation.
pub fn subject_key(subject: impl std::fmt::Display, operation: &str) -> String {
    format!("{}:{}", subject, operation)
}

/// Observability view of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStats {
    /// The inspected key
    pub key: String,
    /// Admitted requests inside the main window
    pub current_requests: usize,
    /// Admitted requests inside the burst window
    pub current_burst: usize,
    /// Configured main-window limit
    pub max_requests: usize,
    /// Configured burst limit
    pub max_burst: usize,
    /// Configured main window
    pub time_window: Duration,
    /// Whether the key is cooling down
    pub cooldown_active: bool,
    /// Time left in the cooldown
    pub cooldown_remaining: Duration,
}

/// Sliding-window rate limiter with burst protection.
///
/// The limiter never fails: every call returns an [`Admission`] decision.
/// Requests for the same key are serialized by the storage shard lock.
#[derive(Debug)]
pub struct RateLimiter<S = WindowStorage>
where
    S: Storage<String, KeyWindow>,
{
    name: String,
    config: RateLimitConfig,
    storage: S,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl<S> RateLimiter<S>
where
    S: Storage<String, KeyWindow>,
{
    /// Create a limiter over an explicit storage backend.
    pub fn new(
        name: impl Into<String>,
        config: RateLimitConfig,
        storage: S,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            storage,
            clock,
            metrics,
        }
    }

    /// Decide whether a request for `key` is admitted.
    pub fn is_allowed(&self, key: &str) -> Admission {
        let now = self.clock.now();
        let config = self.config;
        let admission = self.storage.with_entry_mut(key.to_string(), KeyWindow::new, |window| {
            window.register(&config, now)
        });

        match &admission {
            Admission::Allowed => {
                self.metrics.record_admitted();
                debug!(limiter = %self.name, key, "request admitted");
            }
            Admission::Denied { reason, .. } => {
                self.metrics.record_denied();
                debug!(limiter = %self.name, key, %reason, "request denied");
            }
        }
        admission
    }

    /// Like [`is_allowed`](Self::is_allowed), but logs denials with the key's stats.
    pub fn check_and_log(&self, key: &str, operation: &str) -> Admission {
        let admission = self.is_allowed(key);
        if let Admission::Denied { reason, .. } = &admission {
            warn!(limiter = %self.name, key, operation, %reason, "rate limit exceeded");
            let stats = self.stats(key);
            info!(
                key,
                current_requests = stats.current_requests,
                current_burst = stats.current_burst,
                cooldown_remaining_secs = stats.cooldown_remaining.as_secs_f64(),
                "rate limit stats"
            );
        }
        admission
    }

    /// Current counts for a key. Unknown keys report zeros.
    pub fn stats(&self, key: &str) -> RateLimitStats {
        let now = self.clock.now();
        let config = self.config;
        let (current_requests, current_burst, cooldown) = self
            .storage
            .with_entry(&key.to_string(), |window| {
                let mut window = window.clone();
                window.purge(&config, now);
                (
                    window.request_count(),
                    window.burst_count(),
                    window.cooldown_remaining(&config, now),
                )
            })
            .unwrap_or((0, 0, None));

        RateLimitStats {
            key: key.to_string(),
            current_requests,
            current_burst,
            max_requests: config.max_requests,
            max_burst: config.burst_limit,
            time_window: config.time_window,
            cooldown_active: cooldown.is_some(),
            cooldown_remaining: cooldown.unwrap_or(Duration::ZERO),
        }
    }

    /// Forget keys that hold no live timestamps and no cooldown.
    ///
    /// Returns the number of keys removed.
    pub fn cleanup_idle(&self) -> usize {
        let now = self.clock.now();
        let config = self.config;
        let before = self.storage.len();
        self.storage
            .retain(|_, window| !window.is_idle(&config, now));
        before.saturating_sub(self.storage.len())
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.storage.len()
    }

    /// The limiter's operation class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The applied limits.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Lazily-populated map of operation class to limiter.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
    defaults: BTreeMap<String, RateLimitConfig>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl RateLimiterRegistry {
    /// Create a registry with per-class default limits.
    pub fn new(
        defaults: BTreeMap<String, RateLimitConfig>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
            defaults,
            clock,
            metrics,
        }
    }

    /// Get the limiter for `name`, creating it with `config` on first reference.
    ///
    /// Later calls return the existing limiter and ignore `config`.
    pub fn get(&self, name: &str, config: RateLimitConfig) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock();
        let limiter = limiters.entry(name.to_string()).or_insert_with(|| {
            debug!(limiter = name, "creating rate limiter");
            Arc::new(RateLimiter::new(
                name,
                config,
                Arc::new(ShardedStorage::new()),
                Arc::clone(&self.clock),
                self.metrics.clone(),
            ))
        });
        Arc::clone(limiter)
    }

    /// Get the limiter for a configured class (default limits for unknown classes).
    pub fn limiter(&self, name: &str) -> Arc<RateLimiter> {
        let config = self.defaults.get(name).copied().unwrap_or_default();
        self.get(name, config)
    }

    /// Run [`RateLimiter::cleanup_idle`] on every limiter.
    pub fn cleanup_idle(&self) -> usize {
        let limiters: Vec<_> = self.limiters.lock().values().cloned().collect();
        limiters.iter().map(|limiter| limiter.cleanup_idle()).sum()
    }

    /// Number of limiters created so far.
    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    /// Check if no limiter was created yet.
    pub fn is_empty(&self) -> bool {
        self.limiters.lock().is_empty()
    }
}
