//! Time-boxed journal of compensating actions.
//!
//! Before a mutation is applied, the orchestration layer records the entity's
//! original and target state with [`RollbackJournal::create`]. While the
//! record is live (`now <= expires_at`) it can be executed exactly once,
//! either through the built-in handler registered for its kind or through a
//! caller-supplied closure. Expired records are swept opportunistically on
//! `create`, at most once per `cleanup_interval`.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, PortError, RollbackHandler, UserStore};
use crate::config::RollbackSettings;
use crate::domain::rollback::{expiry_after, RollbackId, RollbackKind, RollbackOperation};

/// Why a rollback could not be executed.
///
/// The first three variants are idempotency guards rather than failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RollbackError {
    /// No record with this id (never created, deleted or swept)
    #[error("rollback operation not found: {0}")]
    NotFound(RollbackId),
    /// The record was already executed
    #[error("rollback operation already executed: {0}")]
    AlreadyExecuted(RollbackId),
    /// The undo window has closed
    #[error("rollback operation expired: {0}")]
    Expired(RollbackId),
    /// Another caller is executing the record right now
    #[error("rollback operation in progress: {0}")]
    InProgress(RollbackId),
    /// No built-in handler is registered for the record's kind
    #[error("no rollback handler registered for {0}")]
    NoHandler(RollbackKind),
    /// The compensating action failed; the record stays executable
    #[error("rollback {id} failed: {reason}")]
    HandlerFailed {
        /// Record id
        id: RollbackId,
        /// Handler error message
        reason: String,
    },
}

/// Per-kind breakdown in [`RollbackStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    /// Records of this kind
    pub total: usize,
    /// Executed records of this kind
    pub executed: usize,
    /// Expired records of this kind
    pub expired: usize,
}

/// Journal summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackStats {
    /// Records held
    pub total: usize,
    /// Records already executed
    pub executed: usize,
    /// Records past their expiry, not yet swept
    pub expired: usize,
    /// Records that can still be executed
    pub active: usize,
    /// Breakdown per kind
    pub per_kind: BTreeMap<RollbackKind, KindStats>,
    /// TTL for destructive kinds
    pub default_ttl: Duration,
    /// Minimum spacing of expiry sweeps
    pub cleanup_interval: Duration,
}

#[derive(Debug)]
struct Entry {
    operation: RollbackOperation,
    in_flight: bool,
}

#[derive(Debug)]
struct JournalState {
    entries: HashMap<RollbackId, Entry>,
    last_cleanup: Instant,
}

/// In-memory rollback journal.
#[derive(Debug)]
pub struct RollbackJournal {
    state: Mutex<JournalState>,
    handlers: RwLock<HashMap<RollbackKind, Arc<dyn RollbackHandler>>>,
    settings: RollbackSettings,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl RollbackJournal {
    /// Create an empty journal without handlers.
    pub fn new(settings: RollbackSettings, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(JournalState {
                entries: HashMap::new(),
                last_cleanup: now,
            }),
            handlers: RwLock::new(HashMap::new()),
            settings,
            clock,
            metrics,
        }
    }

    /// Register the built-in handler for a kind, replacing any previous one.
    pub fn register_handler(&self, kind: RollbackKind, handler: Arc<dyn RollbackHandler>) {
        self.handlers.write().insert(kind, handler);
    }

    /// Register [`UserStoreRollback`] for every user-related kind.
    pub fn register_user_store(&self, store: Arc<dyn UserStore>) {
        let handler: Arc<dyn RollbackHandler> = Arc::new(UserStoreRollback::new(store));
        for kind in UserStoreRollback::KINDS {
            self.register_handler(kind, Arc::clone(&handler));
        }
    }

    /// Record a compensating action and return its id.
    ///
    /// `ttl` defaults to `default_ttl` for destructive kinds and
    /// `metadata_ttl` otherwise.
    pub fn create(
        &self,
        kind: RollbackKind,
        original_state: Value,
        target_state: Value,
        ttl: Option<Duration>,
        metadata: Option<Map<String, Value>>,
    ) -> RollbackId {
        let now = self.clock.now();
        let ttl = ttl.unwrap_or(if kind.is_destructive() {
            self.settings.default_ttl
        } else {
            self.settings.metadata_ttl
        });

        let id = RollbackId::new();
        let operation = RollbackOperation {
            id,
            kind,
            original_state,
            target_state,
            created_at: now,
            expires_at: expiry_after(now, ttl),
            executed: false,
            metadata: metadata.unwrap_or_default(),
        };

        let mut state = self.state.lock();
        if now.saturating_duration_since(state.last_cleanup) >= self.settings.cleanup_interval {
            self.sweep(&mut state, now);
        }
        state.entries.insert(
            id,
            Entry {
                operation,
                in_flight: false,
            },
        );
        drop(state);

        self.metrics.record_rollback_created();
        info!(rollback_id = %id, %kind, ttl_secs = ttl.as_secs_f64(), "rollback operation created");
        id
    }

    /// Record a role change of `user_id` from `original_role` to `new_role`.
    pub fn create_role_change(
        &self,
        user_id: i64,
        original_role: &str,
        new_role: &str,
        ttl: Option<Duration>,
    ) -> RollbackId {
        self.create(
            RollbackKind::RoleChange,
            json!({ "user_id": user_id, "role": original_role }),
            json!({ "user_id": user_id, "role": new_role }),
            ttl,
            Some(operation_metadata("role_change")),
        )
    }

    /// Record a username change of `user_id`.
    pub fn create_username_change(
        &self,
        user_id: i64,
        original_username: Option<&str>,
        new_username: Option<&str>,
        ttl: Option<Duration>,
    ) -> RollbackId {
        self.create(
            RollbackKind::UsernameChange,
            json!({ "user_id": user_id, "username": original_username }),
            json!({ "user_id": user_id, "username": new_username }),
            ttl,
            Some(operation_metadata("username_update")),
        )
    }

    /// Record the demotion of administrator `user_id` to a regular user.
    pub fn create_admin_removal(
        &self,
        user_id: i64,
        original_role: &str,
        ttl: Option<Duration>,
    ) -> RollbackId {
        self.create(
            RollbackKind::AdminRemoval,
            json!({ "user_id": user_id, "role": original_role }),
            json!({ "user_id": user_id, "role": "user" }),
            ttl,
            Some(operation_metadata("admin_removal")),
        )
    }

    /// Execute a record through the handler registered for its kind.
    ///
    /// # Errors
    /// See [`RollbackError`]. On error the record is left executable unless it
    /// was already executed or expired.
    pub async fn try_execute(&self, id: RollbackId) -> Result<(), RollbackError> {
        let kind = self.state.lock().entries.get(&id).map(|entry| entry.operation.kind);
        let Some(kind) = kind else {
            error!(rollback_id = %id, "rollback operation not found");
            return Err(RollbackError::NotFound(id));
        };

        let handler = self.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            error!(rollback_id = %id, %kind, "no rollback handler registered");
            return Err(RollbackError::NoHandler(kind));
        };

        self.run(id, |operation| async move { handler.compensate(&operation).await })
            .await
    }

    /// Execute a record with a custom compensating action.
    ///
    /// `rollback` receives the original and target state.
    pub async fn try_execute_with<F, Fut>(
        &self,
        id: RollbackId,
        rollback: F,
    ) -> Result<(), RollbackError>
    where
        F: FnOnce(Value, Value) -> Fut,
        Fut: Future<Output = Result<(), PortError>>,
    {
        self.run(id, |operation| {
            rollback(operation.original_state, operation.target_state)
        })
        .await
    }

    /// Boolean form of [`try_execute`](Self::try_execute).
    pub async fn execute(&self, id: RollbackId) -> bool {
        self.try_execute(id).await.is_ok()
    }

    /// Boolean form of [`try_execute_with`](Self::try_execute_with).
    pub async fn execute_with<F, Fut>(&self, id: RollbackId, rollback: F) -> bool
    where
        F: FnOnce(Value, Value) -> Fut,
        Fut: Future<Output = Result<(), PortError>>,
    {
        self.try_execute_with(id, rollback).await.is_ok()
    }

    /// Remove a record. Returns `false` if it did not exist.
    pub fn delete(&self, id: RollbackId) -> bool {
        let removed = self.state.lock().entries.remove(&id).is_some();
        if removed {
            info!(rollback_id = %id, "rollback operation deleted");
        }
        removed
    }

    /// Copy of one record.
    pub fn get(&self, id: RollbackId) -> Option<RollbackOperation> {
        self.state
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.operation.clone())
    }

    /// Records, oldest first, optionally filtered by kind.
    pub fn list(&self, kind: Option<RollbackKind>, include_expired: bool) -> Vec<RollbackOperation> {
        let now = self.clock.now();
        let mut operations: Vec<RollbackOperation> = self
            .state
            .lock()
            .entries
            .values()
            .map(|entry| &entry.operation)
            .filter(|op| kind.map_or(true, |kind| op.kind == kind))
            .filter(|op| include_expired || !op.is_expired(now))
            .cloned()
            .collect();
        operations.sort_by_key(|op| op.created_at);
        operations
    }

    /// Remove every expired record now, ignoring the cleanup throttle.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.sweep(&mut state, now)
    }

    /// Journal summary.
    pub fn stats(&self) -> RollbackStats {
        let now = self.clock.now();
        let state = self.state.lock();
        let mut per_kind: BTreeMap<RollbackKind, KindStats> = BTreeMap::new();
        let (mut executed, mut expired, mut active) = (0, 0, 0);

        for entry in state.entries.values() {
            let op = &entry.operation;
            let kind_stats = per_kind.entry(op.kind).or_default();
            kind_stats.total += 1;
            if op.executed {
                executed += 1;
                kind_stats.executed += 1;
            }
            if op.is_expired(now) {
                expired += 1;
                kind_stats.expired += 1;
            }
            if op.is_active(now) {
                active += 1;
            }
        }

        RollbackStats {
            total: state.entries.len(),
            executed,
            expired,
            active,
            per_kind,
            default_ttl: self.settings.default_ttl,
            cleanup_interval: self.settings.cleanup_interval,
        }
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the journal holds no records.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    async fn run<F, Fut>(&self, id: RollbackId, compensate: F) -> Result<(), RollbackError>
    where
        F: FnOnce(RollbackOperation) -> Fut,
        Fut: Future<Output = Result<(), PortError>>,
    {
        let operation = self.claim(id)?;
        let mut claim = Claim {
            journal: self,
            id,
            done: false,
        };

        let result = compensate(operation).await;
        claim.done = true;

        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&id);
        match result {
            Ok(()) => {
                if let Some(entry) = entry {
                    entry.in_flight = false;
                    entry.operation.executed = true;
                }
                drop(state);
                self.metrics.record_rollback_executed();
                info!(rollback_id = %id, "rollback executed");
                Ok(())
            }
            Err(e) => {
                if let Some(entry) = entry {
                    entry.in_flight = false;
                }
                drop(state);
                error!(rollback_id = %id, error = %e, "rollback failed");
                Err(RollbackError::HandlerFailed {
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn claim(&self, id: RollbackId) -> Result<RollbackOperation, RollbackError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            error!(rollback_id = %id, "rollback operation not found");
            return Err(RollbackError::NotFound(id));
        };
        if entry.operation.executed {
            warn!(rollback_id = %id, "rollback operation already executed");
            return Err(RollbackError::AlreadyExecuted(id));
        }
        if entry.operation.is_expired(now) {
            error!(rollback_id = %id, "rollback operation expired");
            return Err(RollbackError::Expired(id));
        }
        if entry.in_flight {
            warn!(rollback_id = %id, "rollback operation already in progress");
            return Err(RollbackError::InProgress(id));
        }
        entry.in_flight = true;
        Ok(entry.operation.clone())
    }

    fn sweep(&self, state: &mut JournalState, now: Instant) -> usize {
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.in_flight || !entry.operation.is_expired(now));
        state.last_cleanup = now;

        let removed = before - state.entries.len();
        if removed > 0 {
            self.metrics.record_rollbacks_expired(removed as u64);
            info!(removed, "cleaned up expired rollback operations");
        } else {
            debug!("no expired rollback operations");
        }
        removed
    }
}

// Releases the in-flight mark if the executing future is dropped mid-compensation
struct Claim<'a> {
    journal: &'a RollbackJournal,
    id: RollbackId,
    done: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Some(entry) = self.journal.state.lock().entries.get_mut(&self.id) {
                entry.in_flight = false;
            }
        }
    }
}

fn operation_metadata(operation: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("operation".to_string(), Value::from(operation));
    metadata
}

/// Built-in handler restoring a user's role or username through a [`UserStore`].
///
/// Expects `user_id` plus `role` (role change, admin removal) or `username`
/// (username change, may be null) in the original state.
#[derive(Debug, Clone)]
pub struct UserStoreRollback {
    store: Arc<dyn UserStore>,
}

impl UserStoreRollback {
    /// Kinds this handler can compensate.
    pub const KINDS: [RollbackKind; 3] = [
        RollbackKind::RoleChange,
        RollbackKind::UsernameChange,
        RollbackKind::AdminRemoval,
    ];

    /// Wrap a user store.
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RollbackHandler for UserStoreRollback {
    async fn compensate(&self, operation: &RollbackOperation) -> Result<(), PortError> {
        let user_id = operation
            .original_i64("user_id")
            .ok_or("original state has no user_id")?;

        match operation.kind {
            RollbackKind::RoleChange | RollbackKind::AdminRemoval => {
                let role = operation
                    .original_str("role")
                    .ok_or("original state has no role")?;
                info!(user_id, role, "restoring user role");
                self.store.set_role(user_id, role).await
            }
            RollbackKind::UsernameChange => {
                let username = operation.original_str("username");
                info!(user_id, ?username, "restoring username");
                self.store.update_username(user_id, username).await
            }
            other => Err(format!("{} is not a user mutation", other).into()),
        }
    }
}
