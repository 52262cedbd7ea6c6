//! Logical transactions: groups of forward/compensating statements.
//!
//! By default the log is a journal of intent. The caller applies the forward
//! statements through its own store transaction, records them here, and
//! [`commit`](TransactionLog::commit)s or [`rollback`](TransactionLog::rollback)s
//! the logical transaction. Either transition removes it from the live set.
//!
//! [`apply`](TransactionLog::apply) turns the log into an executor: it runs
//! every forward statement inside one native store transaction and, when the
//! store cannot roll back natively, replays the compensating statements of
//! the already-applied operations in reverse order.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, StatementExecutor};
use crate::config::TransactionSettings;
use crate::domain::transaction::{
    IsolationHint, LogicalTransaction, Statement, TransactionId, TransactionOperation,
    TransactionState,
};

/// Transaction log errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// Unknown id, or the transaction already left the live set
    #[error("transaction not found: {0}")]
    NotFound(TransactionId),
    /// The transaction no longer accepts operations or commits
    #[error("transaction {id} is not pending: {}", .state.as_str())]
    NotPending {
        /// Transaction id
        id: TransactionId,
        /// Current state
        state: TransactionState,
    },
    /// The store rejected a statement; the transaction was rolled back
    #[error("transaction {id} aborted: {reason}")]
    Aborted {
        /// Transaction id
        id: TransactionId,
        /// Store error message
        reason: String,
    },
    /// Neither the native rollback nor the compensating statements succeeded
    #[error("transaction {id} failed and could not be compensated: {reason}")]
    CompensationFailed {
        /// Transaction id
        id: TransactionId,
        /// Store error message
        reason: String,
    },
}

/// Summary of the live set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStats {
    /// Live transactions
    pub live: usize,
    /// Live transactions per state name
    pub state_counts: BTreeMap<&'static str, usize>,
    /// Age of the oldest live transaction
    pub oldest_age: Option<Duration>,
    /// Minimum spacing of opportunistic sweeps
    pub sweep_interval: Duration,
}

#[derive(Debug)]
struct LogState {
    live: HashMap<TransactionId, LogicalTransaction>,
    last_sweep: Instant,
}

/// In-memory registry of logical transactions.
#[derive(Debug)]
pub struct TransactionLog {
    state: Mutex<LogState>,
    next_id: AtomicU64,
    settings: TransactionSettings,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl TransactionLog {
    /// Create an empty log.
    pub fn new(settings: TransactionSettings, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(LogState {
                live: HashMap::new(),
                last_sweep: now,
            }),
            next_id: AtomicU64::new(1),
            settings,
            clock,
            metrics,
        }
    }

    /// Start a pending transaction.
    ///
    /// `timeout` defaults to the configured `default_timeout`.
    pub fn begin(&self, timeout: Option<Duration>, isolation: IsolationHint) -> TransactionId {
        let now = self.clock.now();
        let id = TransactionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let timeout = timeout.unwrap_or(self.settings.default_timeout);

        let mut state = self.state.lock();
        if now.saturating_duration_since(state.last_sweep) >= self.settings.sweep_interval {
            self.sweep(&mut state, now);
        }
        state
            .live
            .insert(id, LogicalTransaction::new(id, now, timeout, isolation));
        debug!(tx_id = %id, isolation = isolation.as_sql(), "transaction started");
        id
    }

    /// Append an operation to a pending transaction.
    ///
    /// # Errors
    /// [`TransactionError::NotFound`] or [`TransactionError::NotPending`].
    pub fn try_add_operation(
        &self,
        id: TransactionId,
        kind: &str,
        forward: Statement,
        compensating: Option<Statement>,
    ) -> Result<(), TransactionError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let tx = pending_mut(&mut state, id)?;
        tx.operations.push(TransactionOperation {
            kind: kind.to_string(),
            forward,
            compensating,
            added_at: now,
        });
        debug!(tx_id = %id, kind, "operation added to transaction");
        Ok(())
    }

    /// Boolean form of [`try_add_operation`](Self::try_add_operation).
    pub fn add_operation(
        &self,
        id: TransactionId,
        kind: &str,
        forward: Statement,
        compensating: Option<Statement>,
    ) -> bool {
        self.try_add_operation(id, kind, forward, compensating)
            .is_ok()
    }

    /// Mark a pending transaction as committed and drop it from the live set.
    ///
    /// The statements are not executed; see [`apply`](Self::apply) for that.
    /// Returns the final record, in state `Active`.
    pub fn try_commit(&self, id: TransactionId) -> Result<LogicalTransaction, TransactionError> {
        let mut state = self.state.lock();
        pending_mut(&mut state, id)?.state = TransactionState::Active;
        let tx = state.live.remove(&id).ok_or(TransactionError::NotFound(id))?;
        drop(state);

        self.metrics.record_committed();
        info!(tx_id = %id, operations = tx.operations.len(), "transaction committed");
        Ok(tx)
    }

    /// Boolean form of [`try_commit`](Self::try_commit).
    pub fn commit(&self, id: TransactionId) -> bool {
        self.try_commit(id).is_ok()
    }

    /// Roll back a live transaction and drop it from the live set.
    pub fn try_rollback(&self, id: TransactionId) -> Result<LogicalTransaction, TransactionError> {
        let Some(mut tx) = self.state.lock().live.remove(&id) else {
            warn!(tx_id = %id, "transaction not found for rollback");
            return Err(TransactionError::NotFound(id));
        };
        tx.state = TransactionState::RolledBack;
        self.metrics.record_rolled_back();
        info!(tx_id = %id, "transaction rolled back");
        Ok(tx)
    }

    /// Boolean form of [`try_rollback`](Self::try_rollback).
    pub fn rollback(&self, id: TransactionId) -> bool {
        self.try_rollback(id).is_ok()
    }

    /// Run every forward statement of a pending transaction inside one store transaction.
    ///
    /// On success the record is returned in state `Committed`. When a statement
    /// or the commit fails, the store transaction is rolled back; if that fails
    /// too, the compensating statements of the applied operations are replayed
    /// in reverse order.
    ///
    /// # Errors
    /// [`TransactionError::Aborted`] when the transaction was undone,
    /// [`TransactionError::CompensationFailed`] when it could not be undone.
    pub async fn apply<X>(
        &self,
        id: TransactionId,
        executor: &mut X,
    ) -> Result<LogicalTransaction, TransactionError>
    where
        X: StatementExecutor + ?Sized,
    {
        let mut tx = {
            let mut state = self.state.lock();
            let tx = pending_mut(&mut state, id)?;
            tx.state = TransactionState::Active;
            tx.clone()
        };

        if let Err(e) = executor.begin(tx.isolation).await {
            self.finish(id, TransactionState::RolledBack);
            error!(tx_id = %id, error = %e, "could not begin store transaction");
            return Err(TransactionError::Aborted {
                id,
                reason: e.to_string(),
            });
        }

        let mut applied = 0;
        let mut failure = None;
        for operation in &tx.operations {
            if let Err(e) = executor.execute(&operation.forward).await {
                failure = Some(e.to_string());
                break;
            }
            applied += 1;
        }
        if failure.is_none() {
            if let Err(e) = executor.commit().await {
                failure = Some(e.to_string());
            }
        }

        let Some(reason) = failure else {
            self.finish(id, TransactionState::Committed);
            tx.state = TransactionState::Committed;
            info!(tx_id = %id, operations = applied, "transaction applied");
            return Ok(tx);
        };

        warn!(tx_id = %id, error = %reason, applied, "transaction failed, rolling back");
        match executor.rollback().await {
            Ok(()) => {
                self.finish(id, TransactionState::RolledBack);
                Err(TransactionError::Aborted { id, reason })
            }
            Err(rollback_error) => {
                warn!(
                    tx_id = %id,
                    error = %rollback_error,
                    "store rollback failed, replaying compensating statements"
                );
                match compensate(executor, &tx.operations[..applied]).await {
                    Ok(()) => {
                        self.finish(id, TransactionState::RolledBack);
                        Err(TransactionError::Aborted { id, reason })
                    }
                    Err(compensation_error) => {
                        self.finish(id, TransactionState::Failed);
                        error!(tx_id = %id, error = %compensation_error, "compensation failed");
                        Err(TransactionError::CompensationFailed {
                            id,
                            reason: compensation_error,
                        })
                    }
                }
            }
        }
    }

    /// Copy of a live transaction.
    pub fn get(&self, id: TransactionId) -> Option<LogicalTransaction> {
        self.state.lock().live.get(&id).cloned()
    }

    /// Copies of every live transaction, oldest first.
    pub fn active(&self) -> Vec<LogicalTransaction> {
        let mut live: Vec<_> = self.state.lock().live.values().cloned().collect();
        live.sort_by_key(|tx| tx.id);
        live
    }

    /// Roll back every live transaction older than its timeout.
    pub fn sweep_stale(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.sweep(&mut state, now)
    }

    /// Summary of the live set.
    pub fn stats(&self) -> TransactionStats {
        let now = self.clock.now();
        let state = self.state.lock();
        let mut state_counts = BTreeMap::new();
        for tx in state.live.values() {
            *state_counts.entry(tx.state.as_str()).or_insert(0) += 1;
        }
        TransactionStats {
            live: state.live.len(),
            state_counts,
            oldest_age: state.live.values().map(|tx| tx.age(now)).max(),
            sweep_interval: self.settings.sweep_interval,
        }
    }

    fn finish(&self, id: TransactionId, outcome: TransactionState) {
        self.state.lock().live.remove(&id);
        match outcome {
            TransactionState::Committed => self.metrics.record_committed(),
            TransactionState::RolledBack => self.metrics.record_rolled_back(),
            _ => self.metrics.record_tx_failed(),
        }
        debug!(tx_id = %id, state = outcome.as_str(), "transaction finished");
    }

    fn sweep(&self, state: &mut LogState, now: Instant) -> usize {
        let stale: Vec<TransactionId> = state
            .live
            .values()
            .filter(|tx| tx.is_stale(now))
            .map(|tx| tx.id)
            .collect();

        for id in &stale {
            if let Some(tx) = state.live.remove(id) {
                warn!(
                    tx_id = %id,
                    age_secs = tx.age(now).as_secs_f64(),
                    "cleaning up stale transaction"
                );
                self.metrics.record_tx_swept();
            }
        }
        state.last_sweep = now;
        stale.len()
    }
}

fn pending_mut(
    state: &mut LogState,
    id: TransactionId,
) -> Result<&mut LogicalTransaction, TransactionError> {
    let Some(tx) = state.live.get_mut(&id) else {
        error!(tx_id = %id, "transaction not found");
        return Err(TransactionError::NotFound(id));
    };
    if tx.state != TransactionState::Pending {
        error!(tx_id = %id, state = tx.state.as_str(), "transaction is not pending");
        return Err(TransactionError::NotPending {
            id,
            state: tx.state,
        });
    }
    Ok(tx)
}

async fn compensate<X>(executor: &mut X, applied: &[TransactionOperation]) -> Result<(), String>
where
    X: StatementExecutor + ?Sized,
{
    for operation in applied.iter().rev() {
        let Some(statement) = &operation.compensating else {
            return Err(format!(
                "{} operation has no compensating statement",
                operation.kind
            ));
        };
        executor
            .execute(statement)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}
