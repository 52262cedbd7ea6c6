//! # mutation-guard
//!
//! Protection for destructive administrative mutations in a single async process.
//!
//! Five components compose around one call path, the *protected mutation*:
//!
//! 1. A **rate limiter** admits or denies the `subject:operation` key
//!    (sliding window, burst window and cooldown).
//! 2. A **concurrency manager** takes a named lock for the target entity.
//! 3. A **circuit breaker** wraps the read and the write against the
//!    dependency, so a failing store is not hammered.
//! 4. A **rollback journal** records the original and target state before
//!    the write, so the change can be undone within a TTL.
//! 5. A **transaction log** groups several store statements with their
//!    compensating statements.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mutation_guard::{MutationGuard, MutationRequest, RollbackKind};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = MutationGuard::builder().build()?;
//!
//! let request = MutationRequest::new(
//!     42,                          // who
//!     "remove_admin",              // operation
//!     RollbackKind::AdminRemoval,  // what can be undone
//!     "user:7",                    // entity lock
//!     json!({ "user_id": 7, "role": "user" }),
//! );
//!
//! let result = guard
//!     .protected_mutation(
//!         request,
//!         || async { Ok::<_, std::io::Error>(json!({ "user_id": 7, "role": "admin" })) },
//!         || async { Ok(()) },
//!     )
//!     .await;
//!
//! match result {
//!     Ok(outcome) => println!("undo with {}", outcome.rollback_id),
//!     Err(e) => println!("{}", e.user_message()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`GuardConfig`] holds every tunable and loads from JSON. Durations are in
//! seconds and every field has a default:
//!
//! ```rust
//! use mutation_guard::{GuardConfig, MutationGuard};
//!
//! let config = GuardConfig::from_json_str(r#"{
//!     "rate_limits": {
//!         "admin-ops": { "max_requests": 5, "time_window": 60, "burst_limit": 2, "cooldown_period": 30 }
//!     },
//!     "breaker": { "failure_threshold": 3, "recovery_timeout": 60 }
//! }"#).unwrap();
//!
//! let guard = MutationGuard::new(config).unwrap();
//! assert_eq!(guard.config().breaker.failure_threshold, 3);
//! ```
//!
//! ## Error Handling
//!
//! Nothing in this crate panics or aborts the process. Every failure is a
//! value:
//!
//! | Failure | Type | Caller action |
//! |---------|------|---------------|
//! | Admission denied | [`GuardError::RateLimited`] | Show retry-after hint |
//! | Dependency unhealthy | [`GuardError::CircuitOpen`] | Show degraded-service message |
//! | Lock contention | [`ConcurrencyError`] | Abort this request, nothing was written |
//! | Undo refused | [`RollbackError`] | Not found, expired or already executed |
//! | Transaction misuse | [`TransactionError`] | Programmer error |
//!
//! The boolean methods required by older call sites (`execute`, `delete`,
//! `commit`, `rollback`, `acquire`, `release`) wrap `try_*` variants that
//! return the error.
//!
//! ## Time
//!
//! Every component reads time through the [`Clock`] port. Tests pass a
//! `MockClock` (feature `test-helpers`) and move time explicitly:
//!
//! ```rust
//! use mutation_guard::infrastructure::mocks::MockClock;
//! use mutation_guard::{Clock, MutationGuard, RollbackKind};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//!
//! let clock = MockClock::new(Instant::now());
//! let guard = MutationGuard::builder()
//!     .with_clock(Arc::new(clock.clone()))
//!     .build()
//!     .unwrap();
//!
//! let id = guard.journal().create(
//!     RollbackKind::RoleChange,
//!     json!({ "user_id": 1, "role": "admin" }),
//!     json!({ "user_id": 1, "role": "user" }),
//!     Some(Duration::from_secs(10)),
//!     None,
//! );
//! clock.advance(Duration::from_secs(11));
//! assert!(guard.journal().get(id).unwrap().is_expired(clock.now()));
//! ```
//!
//! ## Background Maintenance
//!
//! Expired rollbacks, stale transactions, stale locks and idle limiter keys
//! are also cleaned lazily, but a long-running process should start the
//! maintenance task:
//!
//! ```rust,no_run
//! # use mutation_guard::MutationGuard;
//! # async fn run(guard: MutationGuard) {
//! let maintenance = guard.start_maintenance();
//! // ...
//! if let Err(e) = maintenance.shutdown().await {
//!     tracing::error!(error = %e, "maintenance task failed");
//! }
//! # }
//! ```
//!
//! ## Observability
//!
//! Every component logs through `tracing` with structured fields and updates
//! the shared [`Metrics`]:
//!
//! ```rust,no_run
//! # use mutation_guard::MutationGuard;
//! # let guard = MutationGuard::builder().build().unwrap();
//! let snapshot = guard.metrics().snapshot();
//! println!("denial rate: {:.2}%", snapshot.denial_rate() * 100.0);
//! println!("breaker trips: {}", snapshot.breaker_trips);
//! ```

// Domain layer - pure types and decisions
pub mod domain;

// Application layer - components and orchestration
pub mod application;

// Infrastructure layer - port adapters
pub mod infrastructure;

pub mod config;

// Re-export commonly used types for convenience
pub use domain::{
    backoff::BackoffPolicy,
    rate_limit::{Admission, DenialReason, KeyWindow, RateLimitConfig, BURST_WINDOW},
    rollback::{RollbackId, RollbackKind, RollbackOperation},
    transaction::{
        IsolationHint, LogicalTransaction, Statement, TransactionId, TransactionOperation,
        TransactionState,
    },
};

pub use application::{
    circuit_breaker::{
        BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
        CircuitBreakerRegistry, CircuitState,
    },
    concurrency::{
        ActiveLock, ConcurrencyError, ConcurrencyManager, ConcurrencyStats, HolderId, LockCounters,
        LockGuard, LockInfo, LockKind,
    },
    guard::{
        GuardError, MutationGuard, MutationGuardBuilder, MutationOutcome, MutationRequest,
        DEFAULT_DEPENDENCY,
    },
    limiter::{subject_key, RateLimitStats, RateLimiter, RateLimiterRegistry},
    maintenance::{MaintenanceHandle, MaintenanceReport, ShutdownError},
    metrics::{Metrics, MetricsSnapshot},
    ports::{Clock, PortError, RollbackHandler, StatementExecutor, Storage, UserStore},
    retry::{retry_with_backoff, RetryError},
    rollback::{KindStats, RollbackError, RollbackJournal, RollbackStats, UserStoreRollback},
    transaction::{TransactionError, TransactionLog, TransactionStats},
};

pub use config::{
    BreakerSettings, ConcurrencySettings, ConfigError, GuardConfig, MaintenanceSettings,
    RollbackSettings, TransactionSettings, ADMIN_OPS, DB_OPS, MAX_DURATION, STATS_OPS,
};

pub use infrastructure::{clock::SystemClock, storage::ShardedStorage};
