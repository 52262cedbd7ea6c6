//! Compensating-action records.
//!
//! A [`RollbackOperation`] captures the state of an entity before and after a
//! mutation so the change can be undone while the record is still live.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::MAX_DURATION;

/// What kind of mutation a rollback record compensates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackKind {
    /// A user's role was changed
    RoleChange,
    /// A user's username was replaced
    UsernameChange,
    /// An administrator was demoted
    AdminRemoval,
    /// Mailbox settings were updated or the mailbox was deleted
    MailboxUpdate,
    /// A configuration value was changed
    ConfigChange,
}

impl RollbackKind {
    /// Every kind, in declaration order.
    pub const ALL: [RollbackKind; 5] = [
        RollbackKind::RoleChange,
        RollbackKind::UsernameChange,
        RollbackKind::AdminRemoval,
        RollbackKind::MailboxUpdate,
        RollbackKind::ConfigChange,
    ];

    /// Stable string form used in logs and stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackKind::RoleChange => "role_change",
            RollbackKind::UsernameChange => "username_change",
            RollbackKind::AdminRemoval => "admin_removal",
            RollbackKind::MailboxUpdate => "mailbox_update",
            RollbackKind::ConfigChange => "config_change",
        }
    }

    /// Whether the mutation is destructive (longer undo window by default).
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            RollbackKind::RoleChange | RollbackKind::AdminRemoval | RollbackKind::MailboxUpdate
        )
    }
}

impl fmt::Display for RollbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RollbackKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown rollback kind: {}", s))
    }
}

/// Unique identifier of a rollback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollbackId(Uuid);

impl RollbackId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RollbackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RollbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rollback-{}", self.0)
    }
}

/// A recorded compensating action.
#[derive(Debug, Clone)]
pub struct RollbackOperation {
    /// Unique identifier
    pub id: RollbackId,
    /// Mutation kind, selects the built-in handler
    pub kind: RollbackKind,
    /// Entity state before the mutation
    pub original_state: Value,
    /// Entity state the mutation moved to
    pub target_state: Value,
    /// When the record was created
    pub created_at: Instant,
    /// After this instant the record can no longer be executed
    pub expires_at: Instant,
    /// Set exactly once, when the compensation succeeded
    pub executed: bool,
    /// Free-form annotations (operation name, actor, ...)
    pub metadata: Map<String, Value>,
}

impl RollbackOperation {
    /// Check whether the undo window has closed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Check whether the record can still be executed.
    pub fn is_active(&self, now: Instant) -> bool {
        !self.executed && !self.is_expired(now)
    }

    /// Read an integer field from the original state (e.g. `user_id`).
    pub fn original_i64(&self, field: &str) -> Option<i64> {
        self.original_state.get(field).and_then(Value::as_i64)
    }

    /// Read a string field from the original state (e.g. `role`).
    pub fn original_str(&self, field: &str) -> Option<&str> {
        self.original_state.get(field).and_then(Value::as_str)
    }
}

/// Expiry instant `ttl` after `now`, with `ttl` capped at [`MAX_DURATION`].
///
/// Never panics: if the platform cannot represent the instant, the window is
/// halved until it can.
pub fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    let mut ttl = ttl.min(MAX_DURATION);
    loop {
        if let Some(at) = now.checked_add(ttl) {
            return at;
        }
        ttl /= 2;
    }
}
