//! Logical transactions: ordered forward/compensating statement pairs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};

/// Identifier of a logical transaction, unique within one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric value of the identifier.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Lifecycle of a logical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Accepting operations
    Pending,
    /// Committed by the caller or being applied by the executor
    Active,
    /// Applied by the executor
    Committed,
    /// Abandoned or undone
    RolledBack,
    /// The executor could not apply or undo it
    Failed,
}

impl TransactionState {
    /// Stable string form used in logs and stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "pending",
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locking hint forwarded to the underlying store when the transaction is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationHint {
    /// Take locks lazily on first write
    #[default]
    Deferred,
    /// Take the write lock at begin
    Immediate,
    /// Block readers as well as writers
    Exclusive,
}

impl IsolationHint {
    /// Keyword understood by SQL stores (`BEGIN <keyword>`).
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationHint::Deferred => "DEFERRED",
            IsolationHint::Immediate => "IMMEDIATE",
            IsolationHint::Exclusive => "EXCLUSIVE",
        }
    }
}

/// A parameterised statement for the underlying store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Statement text
    pub text: String,
    /// Positional parameters
    pub params: Vec<Value>,
}

impl Statement {
    /// Create a statement from text and parameters.
    pub fn new(text: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            params,
        }
    }
}

/// One recorded step of a logical transaction.
#[derive(Debug, Clone)]
pub struct TransactionOperation {
    /// Operation kind (`INSERT`, `UPDATE`, ...)
    pub kind: String,
    /// Statement that applies the change
    pub forward: Statement,
    /// Statement that reverses the change, if one exists
    pub compensating: Option<Statement>,
    /// When the operation was recorded
    pub added_at: Instant,
}

/// A group of operations sharing one commit/rollback decision.
#[derive(Debug, Clone)]
pub struct LogicalTransaction {
    /// Identifier
    pub id: TransactionId,
    /// Current lifecycle state
    pub state: TransactionState,
    /// When `begin` was called
    pub started_at: Instant,
    /// Age after which the sweep rolls the transaction back
    pub timeout: Duration,
    /// Isolation hint for the executor
    pub isolation: IsolationHint,
    /// Recorded operations in insertion order
    pub operations: Vec<TransactionOperation>,
}

impl LogicalTransaction {
    /// Create a pending transaction.
    pub fn new(
        id: TransactionId,
        started_at: Instant,
        timeout: Duration,
        isolation: IsolationHint,
    ) -> Self {
        Self {
            id,
            state: TransactionState::Pending,
            started_at,
            timeout,
            isolation,
            operations: Vec::new(),
        }
    }

    /// Time since `begin`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Whether the transaction outlived its timeout.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.age(now) > self.timeout
    }
}
