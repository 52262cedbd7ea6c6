//! In-memory stand-ins for the persistent stores.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::application::ports::{PortError, StatementExecutor, UserStore};
use crate::domain::transaction::{IsolationHint, Statement};

#[derive(Debug, Clone, Default)]
struct UserRecord {
    role: String,
    username: Option<String>,
}

/// User store backed by a map.
///
/// Clones share the same users. Writes can be made to fail with
/// [`InMemoryUserStore::fail_writes`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserStore {
    users: Arc<Mutex<HashMap<i64, UserRecord>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryUserStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user.
    pub fn insert_user(&self, user_id: i64, role: &str, username: Option<&str>) {
        self.users.lock().insert(
            user_id,
            UserRecord {
                role: role.to_string(),
                username: username.map(str::to_string),
            },
        );
    }

    /// Current role of a user.
    pub fn role(&self, user_id: i64) -> Option<String> {
        self.users.lock().get(&user_id).map(|user| user.role.clone())
    }

    /// Current username of a user; `None` if the user or the username is missing.
    pub fn username(&self, user_id: i64) -> Option<String> {
        self.users
            .lock()
            .get(&user_id)
            .and_then(|user| user.username.clone())
    }

    /// Make every following write fail (or succeed again).
    pub fn fail_writes(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    fn write(&self, user_id: i64, apply: impl FnOnce(&mut UserRecord)) -> Result<(), PortError> {
        if *self.failing.lock() {
            return Err("user store unavailable".into());
        }
        let mut users = self.users.lock();
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| format!("user {} not found", user_id))?;
        apply(user);
        Ok(())
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn set_role(&self, user_id: i64, role: &str) -> Result<(), PortError> {
        self.write(user_id, |user| user.role = role.to_string())
    }

    async fn update_username(
        &self,
        user_id: i64,
        username: Option<&str>,
    ) -> Result<(), PortError> {
        self.write(user_id, |user| user.username = username.map(str::to_string))
    }
}

/// Statement executor that records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    executed: Vec<Statement>,
    calls: usize,
    fail_on: Option<usize>,
    fail_rollback: bool,
    began: Option<IsolationHint>,
    committed: bool,
    rolled_back: bool,
}

impl RecordingExecutor {
    /// Create an executor on which everything succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`-th `execute` call (counting from zero).
    pub fn fail_on_statement(mut self, n: usize) -> Self {
        self.fail_on = Some(n);
        self
    }

    /// Make the native rollback fail.
    pub fn fail_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    /// Statements that executed successfully, in order.
    pub fn executed(&self) -> &[Statement] {
        &self.executed
    }

    /// Isolation hint passed to the last `begin`.
    pub fn began(&self) -> Option<IsolationHint> {
        self.began
    }

    /// Check if the native transaction committed.
    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Check if the native transaction was rolled back.
    pub fn rolled_back(&self) -> bool {
        self.rolled_back
    }
}

#[async_trait]
impl StatementExecutor for RecordingExecutor {
    async fn begin(&mut self, isolation: IsolationHint) -> Result<(), PortError> {
        self.began = Some(isolation);
        Ok(())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<(), PortError> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on == Some(call) {
            return Err(format!("statement {} rejected: {}", call, statement.text).into());
        }
        self.executed.push(statement.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PortError> {
        self.committed = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PortError> {
        if self.fail_rollback {
            return Err("connection lost during rollback".into());
        }
        self.rolled_back = true;
        Ok(())
    }
}
