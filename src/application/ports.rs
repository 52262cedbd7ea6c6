//! Ports (interfaces) for the application layer.
//!
//! The application layer talks to time, per-key state storage, the user
//! store and the statement store only through these traits. Infrastructure
//! provides the production adapters (`SystemClock`, `ShardedStorage`) and the
//! test doubles; the persistent stores belong to the embedding application.

use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Instant;

use crate::domain::rollback::RollbackOperation;
use crate::domain::transaction::{IsolationHint, Statement};

/// Boxed error returned by collaborator ports.
pub type PortError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Port for obtaining current time.
///
/// Every expiry, window and cooldown computation goes through this trait so
/// tests can drive time explicitly with `MockClock`.
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;
}

/// Port for concurrent per-key state.
///
/// Accesses to one key are serialized by the implementation; accesses to
/// distinct keys may proceed in parallel.
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Access an entry with mutable access, creating it if necessary.
    ///
    /// # Arguments
    /// * `key` - The key to look up
    /// * `factory` - Function to create a new value if the key doesn't exist
    /// * `accessor` - Function that gets mutable access to the value
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R;

    /// Access an existing entry without creating it.
    fn with_entry<F, R>(&self, key: &K, accessor: F) -> Option<R>
    where
        F: FnOnce(&V) -> R;

    /// Get the number of entries in the storage.
    fn len(&self) -> usize;

    /// Check if the storage is empty.
    fn is_empty(&self) -> bool;

    /// Remove entries for which the predicate returns false.
    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool;
}

/// Port for the store that holds user roles and usernames.
///
/// Consumed by the built-in rollback handlers to restore the original state
/// of a user after a role change, username change or admin removal.
#[async_trait]
pub trait UserStore: Send + Sync + Debug {
    /// Overwrite the role of a user.
    async fn set_role(&self, user_id: i64, role: &str) -> Result<(), PortError>;

    /// Overwrite (or clear) the username of a user.
    async fn update_username(&self, user_id: i64, username: Option<&str>)
        -> Result<(), PortError>;
}

/// Port for a compensating action bound to one rollback kind.
#[async_trait]
pub trait RollbackHandler: Send + Sync + Debug {
    /// Restore `operation.original_state`.
    async fn compensate(&self, operation: &RollbackOperation) -> Result<(), PortError>;
}

/// Port for a store connection able to run statements inside its own transaction.
///
/// Used by `TransactionLog::apply`. Implementations wrap one connection, so
/// methods take `&mut self`.
#[async_trait]
pub trait StatementExecutor: Send {
    /// Start a native store transaction.
    async fn begin(&mut self, isolation: IsolationHint) -> Result<(), PortError>;

    /// Run one statement inside the native transaction.
    async fn execute(&mut self, statement: &Statement) -> Result<(), PortError>;

    /// Commit the native transaction.
    async fn commit(&mut self) -> Result<(), PortError>;

    /// Abort the native transaction.
    async fn rollback(&mut self) -> Result<(), PortError>;
}
