//! Demoting administrators through a `MutationGuard`.
//!
//! Shows admission control, the rollback journal and the circuit breaker
//! around a small in-memory users table.
//!
//! Run with `RUST_LOG=debug` to see every decision.

use async_trait::async_trait;
use mutation_guard::{
    GuardConfig, GuardError, MutationGuard, MutationRequest, PortError, RollbackKind, UserStore,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct UsersTable {
    roles: Mutex<HashMap<i64, String>>,
}

impl UsersTable {
    async fn role(&self, user_id: i64) -> Result<Value, PortError> {
        let roles = self.roles.lock().await;
        let role = roles.get(&user_id).ok_or("no such user")?;
        Ok(json!({ "user_id": user_id, "role": role }))
    }
}

#[async_trait]
impl UserStore for UsersTable {
    async fn set_role(&self, user_id: i64, role: &str) -> Result<(), PortError> {
        self.roles.lock().await.insert(user_id, role.to_string());
        Ok(())
    }

    async fn update_username(&self, _user_id: i64, _username: Option<&str>) -> Result<(), PortError> {
        Ok(())
    }
}

async fn remove_admin(
    guard: &MutationGuard,
    users: &UsersTable,
    by: i64,
    user_id: i64,
) -> Result<(), GuardError<PortError>> {
    let request = MutationRequest::new(
        by,
        "remove_admin",
        RollbackKind::AdminRemoval,
        format!("user:{}", user_id),
        json!({ "user_id": user_id, "role": "user" }),
    );
    let outcome = guard
        .protected_mutation(
            request,
            || users.role(user_id),
            || users.set_role(user_id, "user"),
        )
        .await?;
    println!("  user {} demoted, undo id {}", user_id, outcome.rollback_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let users = Arc::new(UsersTable::default());
    for user_id in 1..=4 {
        users.set_role(user_id, "admin").await?;
    }

    let guard = MutationGuard::builder()
        .with_config(GuardConfig::default())
        .with_user_store(users.clone())
        .build()?;
    let maintenance = guard.start_maintenance();

    println!("=== Burst protection ===");
    println!("admin-ops allows 2 requests per 5 seconds per admin\n");
    for user_id in 1..=3 {
        if let Err(e) = remove_admin(&guard, &users, 100, user_id).await {
            println!("  user {}: {}", user_id, e.user_message());
        }
    }

    println!("\n=== Undo ===");
    let last = guard
        .journal()
        .list(Some(RollbackKind::AdminRemoval), false)
        .pop();
    if let Some(record) = last {
        guard.undo(record.id).await?;
        println!("  restored {}", users.role(record.original_i64("user_id").unwrap_or(0)).await?);
        println!("  second undo accepted: {}", guard.journal().execute(record.id).await);
    }

    println!("\n=== Failing read ===");
    if let Err(e) = remove_admin(&guard, &users, 200, 99).await {
        println!("  {}", e);
        println!("  breaker state: {}", guard.breakers().breaker("database").state());
    }

    let snapshot = guard.metrics().snapshot();
    println!("\n=== Metrics ===");
    println!("  admitted: {}", snapshot.requests_admitted);
    println!("  denied: {}", snapshot.requests_denied);
    println!("  rollbacks created: {}", snapshot.rollbacks_created);
    println!("  rollbacks executed: {}", snapshot.rollbacks_executed);

    maintenance.shutdown().await?;
    Ok(())
}
