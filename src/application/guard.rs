//! The guard service: one object owning every component.
//!
//! A [`MutationGuard`] is built once and shared (it is cheap to clone) by
//! every request handler. [`MutationGuard::protected_mutation`] runs the full
//! admission → lock → read → journal → write path for one change.

use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::circuit_breaker::{BreakerError, CircuitBreakerRegistry};
use crate::application::concurrency::{ConcurrencyError, ConcurrencyManager};
use crate::application::limiter::{subject_key, RateLimiterRegistry};
use crate::application::maintenance::{MaintenanceHandle, MaintenanceReport};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, RollbackHandler, UserStore};
use crate::application::retry::{retry_with_backoff, RetryError};
use crate::application::rollback::{RollbackError, RollbackJournal};
use crate::application::transaction::TransactionLog;
use crate::config::{ConfigError, GuardConfig, ADMIN_OPS};
use crate::domain::rate_limit::{Admission, DenialReason};
use crate::domain::rollback::{RollbackId, RollbackKind};
use crate::infrastructure::clock::SystemClock;

/// Dependency name used when a request does not name one.
pub const DEFAULT_DEPENDENCY: &str = "database";

/// Error returned by [`MutationGuard::protected_mutation`].
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The subject exceeded its admission budget
    #[error("{reason}")]
    RateLimited {
        /// Which limit was hit
        reason: DenialReason,
        /// Earliest moment a retry can succeed
        retry_after: Duration,
    },
    /// The dependency's circuit is open; it was not called
    #[error("dependency '{dependency}' is unavailable, retry in {:.1}s", .retry_after.as_secs_f64())]
    CircuitOpen {
        /// Dependency name
        dependency: String,
        /// Time until the breaker admits a probe
        retry_after: Duration,
    },
    /// The entity lock could not be taken; nothing was changed
    #[error(transparent)]
    Contention(#[from] ConcurrencyError),
    /// The dependency was called and failed
    #[error("dependency call failed: {0}")]
    Dependency(E),
}

impl<E> GuardError<E> {
    /// Text suitable for showing to the end user.
    pub fn user_message(&self) -> String {
        match self {
            GuardError::RateLimited { reason, retry_after } => format!(
                "{}. Please try again in {} seconds.",
                reason,
                retry_after.as_secs_f64().ceil() as u64
            ),
            GuardError::CircuitOpen { .. } => {
                "The service is temporarily unavailable. Please try again later.".to_string()
            }
            GuardError::Contention(ConcurrencyError::ShutDown) => {
                "The service is shutting down. Please try again later.".to_string()
            }
            GuardError::Contention(_) => {
                "Another operation on this item is in progress. Please try again.".to_string()
            }
            GuardError::Dependency(_) => {
                "The operation could not be completed. Please try again later.".to_string()
            }
        }
    }

    /// Suggested delay before retrying, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GuardError::RateLimited { retry_after, .. }
            | GuardError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            GuardError::Contention(_) | GuardError::Dependency(_) => None,
        }
    }
}

impl<E> From<BreakerError<E>> for GuardError<E> {
    fn from(e: BreakerError<E>) -> Self {
        match e {
            BreakerError::Open { name, retry_after } => GuardError::CircuitOpen {
                dependency: name,
                retry_after,
            },
            BreakerError::Inner(e) => GuardError::Dependency(e),
        }
    }
}

/// Description of one protected change.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    /// Who performs the change (user id, chat id, ...)
    pub subject: String,
    /// Operation name; forms the limiter key with `subject`
    pub operation: String,
    /// Rate-limit class the operation belongs to
    pub operation_class: String,
    /// Name of the lock serializing changes to the target entity
    pub entity: String,
    /// Circuit breaker wrapping the read and the write
    pub dependency: String,
    /// Rollback kind recorded in the journal
    pub kind: RollbackKind,
    /// State the write will produce
    pub target_state: Value,
    /// Undo window; `None` uses the journal defaults
    pub ttl: Option<Duration>,
    /// Lock acquisition timeout; `None` uses the manager default
    pub lock_timeout: Option<Duration>,
}

impl MutationRequest {
    /// Describe a change of `entity` by `subject`, in the `admin-ops` class
    /// against the `database` dependency.
    pub fn new(
        subject: impl fmt::Display,
        operation: impl Into<String>,
        kind: RollbackKind,
        entity: impl Into<String>,
        target_state: Value,
    ) -> Self {
        Self {
            subject: subject.to_string(),
            operation: operation.into(),
            operation_class: ADMIN_OPS.to_string(),
            entity: entity.into(),
            dependency: DEFAULT_DEPENDENCY.to_string(),
            kind,
            target_state,
            ttl: None,
            lock_timeout: None,
        }
    }

    /// Use another rate-limit class.
    pub fn with_operation_class(mut self, class: impl Into<String>) -> Self {
        self.operation_class = class.into();
        self
    }

    /// Use another dependency breaker.
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = dependency.into();
        self
    }

    /// Set the undo window.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("operation".to_string(), json!(self.operation));
        metadata.insert("subject".to_string(), json!(self.subject));
        metadata.insert("entity".to_string(), json!(self.entity));
        metadata
    }
}

/// Result of a successful protected mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    /// Journal record that can undo the change
    pub rollback_id: RollbackId,
    /// State read before the write
    pub original: Value,
    /// State written
    pub target: Value,
}

/// Builder for [`MutationGuard`].
pub struct MutationGuardBuilder {
    config: GuardConfig,
    clock: Option<Arc<dyn Clock>>,
    user_store: Option<Arc<dyn UserStore>>,
    handlers: Vec<(RollbackKind, Arc<dyn RollbackHandler>)>,
}

impl MutationGuardBuilder {
    /// Replace the whole configuration.
    pub fn with_config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom clock (for testing with `MockClock`).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Install the built-in user rollback handlers over `store`.
    pub fn with_user_store(mut self, store: Arc<dyn UserStore>) -> Self {
        self.user_store = Some(store);
        self
    }

    /// Register a handler for one rollback kind.
    ///
    /// Handlers registered here take precedence over the user store handlers.
    pub fn with_rollback_handler(
        mut self,
        kind: RollbackKind,
        handler: Arc<dyn RollbackHandler>,
    ) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    /// Build the guard.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found in the configuration.
    pub fn build(self) -> Result<MutationGuard, ConfigError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let metrics = Metrics::new();
        let config = self.config;

        let limiters = RateLimiterRegistry::new(
            config.rate_limits.clone(),
            Arc::clone(&clock),
            metrics.clone(),
        );
        let breakers =
            CircuitBreakerRegistry::new(config.breaker.into(), Arc::clone(&clock), metrics.clone());
        let locks = ConcurrencyManager::new(config.concurrency, Arc::clone(&clock), metrics.clone());
        let journal = RollbackJournal::new(config.rollback, Arc::clone(&clock), metrics.clone());
        if let Some(store) = self.user_store {
            journal.register_user_store(store);
        }
        for (kind, handler) in self.handlers {
            journal.register_handler(kind, handler);
        }
        let transactions =
            TransactionLog::new(config.transactions, Arc::clone(&clock), metrics.clone());

        Ok(MutationGuard {
            config: Arc::new(config),
            limiters: Arc::new(limiters),
            breakers: Arc::new(breakers),
            locks,
            journal: Arc::new(journal),
            transactions: Arc::new(transactions),
            metrics,
            clock,
        })
    }
}

/// Rate limiting, circuit breaking, locking, rollback and transactions for
/// one process.
///
/// # Examples
///
/// ```
/// use mutation_guard::{GuardConfig, MutationGuard};
///
/// let guard = MutationGuard::new(GuardConfig::default()).unwrap();
/// let limiter = guard.limiters().limiter("admin-ops");
/// assert!(limiter.is_allowed("42:remove_admin").is_allowed());
/// ```
#[derive(Clone)]
pub struct MutationGuard {
    config: Arc<GuardConfig>,
    limiters: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    locks: ConcurrencyManager,
    journal: Arc<RollbackJournal>,
    transactions: Arc<TransactionLog>,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MutationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationGuard")
            .field("limiters", &self.limiters.len())
            .field("rollbacks", &self.journal.len())
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

impl MutationGuard {
    /// Create a guard with the system clock and no rollback handlers.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found in `config`.
    pub fn new(config: GuardConfig) -> Result<Self, ConfigError> {
        Self::builder().with_config(config).build()
    }

    /// Create a builder starting from the default configuration.
    pub fn builder() -> MutationGuardBuilder {
        MutationGuardBuilder {
            config: GuardConfig::default(),
            clock: None,
            user_store: None,
            handlers: Vec::new(),
        }
    }

    /// Run one change through every protection.
    ///
    /// 1. The `subject:operation` key is checked against the operation class limiter.
    /// 2. The entity lock is taken for the rest of the call.
    /// 3. `read` fetches the current state through the dependency breaker.
    /// 4. A rollback record capturing the current and target state is created.
    /// 5. `write` applies the change through the same breaker. If it fails the
    ///    record is discarded.
    ///
    /// # Errors
    /// See [`GuardError`]. When an error is returned nothing was written.
    pub async fn protected_mutation<R, RFut, W, WFut, E>(
        &self,
        request: MutationRequest,
        read: R,
        write: W,
    ) -> Result<MutationOutcome, GuardError<E>>
    where
        R: FnOnce() -> RFut,
        RFut: Future<Output = Result<Value, E>>,
        W: FnOnce() -> WFut,
        WFut: Future<Output = Result<(), E>>,
    {
        let key = subject_key(&request.subject, &request.operation);
        let limiter = self.limiters.limiter(&request.operation_class);
        if let Admission::Denied {
            reason,
            retry_after,
        } = limiter.check_and_log(&key, &request.operation)
        {
            return Err(GuardError::RateLimited {
                reason,
                retry_after,
            });
        }

        let _lock = self
            .locks
            .with_lock(&request.entity, request.lock_timeout, false)
            .await?;
        let breaker = self.breakers.breaker(&request.dependency);

        let original = breaker.call(read).await?;
        let rollback_id = self.journal.create(
            request.kind,
            original.clone(),
            request.target_state.clone(),
            request.ttl,
            Some(request.metadata()),
        );

        if let Err(e) = breaker.call(write).await {
            self.journal.delete(rollback_id);
            warn!(
                key = %key,
                entity = %request.entity,
                rollback_id = %rollback_id,
                circuit_open = e.is_open(),
                "mutation write failed, rollback record discarded"
            );
            return Err(e.into());
        }

        info!(
            key = %key,
            entity = %request.entity,
            rollback_id = %rollback_id,
            kind = %request.kind,
            "mutation applied"
        );
        Ok(MutationOutcome {
            rollback_id,
            original,
            target: request.target_state,
        })
    }

    /// Retry `op` with the configured backoff schedule, giving up after `deadline`.
    ///
    /// Meant for flaky lookups around a mutation (e.g. resolving a username).
    ///
    /// # Errors
    /// See [`RetryError`].
    pub async fn retry<F, Fut, T, E>(&self, deadline: Duration, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        retry_with_backoff(&self.config.retry, deadline, op).await
    }

    /// Undo a change through the handler registered for its kind.
    ///
    /// # Errors
    /// See [`RollbackError`].
    pub async fn undo(&self, id: RollbackId) -> Result<(), RollbackError> {
        self.journal.try_execute(id).await
    }

    /// Run one maintenance pass now.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            rollbacks_expired: self.journal.cleanup_expired(),
            transactions_swept: self.transactions.sweep_stale(),
            stale_locks_released: self
                .locks
                .cleanup_stale(self.config.concurrency.stale_lock_age),
            idle_keys_removed: self.limiters.cleanup_idle(),
        };
        debug!(total = report.total(), "maintenance pass finished");
        report
    }

    /// Spawn the background maintenance task.
    ///
    /// Must be called from within a tokio runtime. The task stops when the
    /// returned handle is shut down or dropped.
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        let guard = self.clone();
        MaintenanceHandle::spawn(self.config.maintenance.interval, move || {
            guard.run_maintenance()
        })
    }

    /// The configuration the guard was built with.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Rate limiters, one per operation class.
    pub fn limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    /// Circuit breakers, one per dependency.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Named locks and semaphores.
    pub fn locks(&self) -> &ConcurrencyManager {
        &self.locks
    }

    /// Rollback journal.
    pub fn journal(&self) -> &RollbackJournal {
        &self.journal
    }

    /// Logical transaction log.
    pub fn transactions(&self) -> &TransactionLog {
        &self.transactions
    }

    /// Shared counters.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The clock every component reads.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
