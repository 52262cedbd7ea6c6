use mutation_guard::infrastructure::mocks::{InMemoryUserStore, MockCaptureLayer, MockClock};
use mutation_guard::{
    ConcurrencyError, GuardConfig, GuardError, MutationGuard, MutationOutcome, MutationRequest,
    RollbackKind, UserStore,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

fn setup(config: GuardConfig) -> (MutationGuard, MockClock, Arc<InMemoryUserStore>) {
    let clock = MockClock::new(Instant::now());
    let store = Arc::new(InMemoryUserStore::new());
    store.insert_user(7, "admin", Some("alice"));
    store.insert_user(8, "admin", Some("bob"));
    let guard = MutationGuard::builder()
        .with_config(config)
        .with_clock(Arc::new(clock.clone()))
        .with_user_store(store.clone())
        .build()
        .unwrap();
    (guard, clock, store)
}

fn remove_admin(subject: i64, user_id: i64) -> MutationRequest {
    MutationRequest::new(
        subject,
        "remove_admin",
        RollbackKind::AdminRemoval,
        format!("user:{}", user_id),
        json!({ "user_id": user_id, "role": "user" }),
    )
}

async fn demote(
    guard: &MutationGuard,
    store: &InMemoryUserStore,
    subject: i64,
    user_id: i64,
) -> Result<MutationOutcome, GuardError<String>> {
    guard
        .protected_mutation(
            remove_admin(subject, user_id),
            || async move {
                Ok::<Value, String>(json!({ "user_id": user_id, "role": store.role(user_id) }))
            },
            || async move {
                store
                    .set_role(user_id, "user")
                    .await
                    .map_err(|e| e.to_string())
            },
        )
        .await
}

#[tokio::test]
async fn test_demote_then_undo() {
    let (guard, _clock, store) = setup(GuardConfig::default());

    let outcome = demote(&guard, &store, 1, 7).await.unwrap();
    assert_eq!(outcome.original, json!({ "user_id": 7, "role": "admin" }));
    assert_eq!(outcome.target, json!({ "user_id": 7, "role": "user" }));
    assert_eq!(store.role(7).as_deref(), Some("user"));

    assert!(guard.journal().execute(outcome.rollback_id).await);
    assert_eq!(store.role(7).as_deref(), Some("admin"));
    assert!(!guard.journal().execute(outcome.rollback_id).await);
}

#[tokio::test]
async fn test_burst_of_demotions_is_limited() {
    let (guard, _clock, store) = setup(GuardConfig::default());
    let capture = MockCaptureLayer::new();
    let _default =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    // admin-ops allows a burst of 2
    demote(&guard, &store, 1, 7).await.unwrap();
    demote(&guard, &store, 1, 8).await.unwrap();
    let err = demote(&guard, &store, 1, 7).await.unwrap_err();

    assert!(matches!(err, GuardError::RateLimited { .. }));
    assert_eq!(err.to_string(), "Burst limit exceeded");
    assert!(err.user_message().starts_with("Burst limit exceeded."));
    assert!(capture.contains(Level::WARN, "rate limit exceeded"));

    // Another admin is not affected
    assert!(demote(&guard, &store, 2, 7).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_mutation_of_same_entity_times_out() {
    let (guard, _clock, store) = setup(GuardConfig::default());
    let held = guard
        .locks()
        .with_lock("user:7", None, false)
        .await
        .unwrap();

    let request = remove_admin(1, 7).with_lock_timeout(Duration::from_secs(1));
    let result = guard
        .protected_mutation(
            request,
            || async { Ok::<Value, String>(json!({ "role": "admin" })) },
            || async { Ok(()) },
        )
        .await;

    match result {
        Err(GuardError::Contention(ConcurrencyError::LockTimeout { name, .. })) => {
            assert_eq!(name, "user:7")
        }
        other => panic!("expected lock timeout, got {:?}", other),
    }
    assert!(guard.journal().is_empty());
    assert_eq!(store.role(7).as_deref(), Some("admin"));
    drop(held);
}

async fn demote_with_failing_read(
    guard: &MutationGuard,
    subject: i64,
) -> Result<MutationOutcome, GuardError<String>> {
    guard
        .protected_mutation(
            remove_admin(subject, 7),
            || async { Err::<Value, String>("database is locked".to_string()) },
            || async { Ok(()) },
        )
        .await
}

#[tokio::test]
async fn test_failing_dependency_opens_circuit() {
    let mut config = GuardConfig::default();
    config.breaker.failure_threshold = 2;
    let (guard, clock, store) = setup(config);

    for subject in 1..=2 {
        let err = demote_with_failing_read(&guard, subject).await.unwrap_err();
        assert!(matches!(err, GuardError::Dependency(ref e) if e == "database is locked"));
    }
    assert!(guard.journal().is_empty());

    let err = demote(&guard, &store, 3, 7).await.unwrap_err();
    assert!(matches!(err, GuardError::CircuitOpen { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    assert_eq!(
        err.user_message(),
        "The service is temporarily unavailable. Please try again later."
    );
    assert_eq!(store.role(7).as_deref(), Some("admin"));

    clock.advance(Duration::from_secs(60));
    assert!(demote(&guard, &store, 4, 7).await.is_ok());
    assert_eq!(store.role(7).as_deref(), Some("user"));
}

#[tokio::test]
async fn test_failed_write_discards_rollback_record() {
    let (guard, _clock, store) = setup(GuardConfig::default());
    store.fail_writes(true);

    let err = demote(&guard, &store, 1, 7).await.unwrap_err();
    assert!(matches!(err, GuardError::Dependency(_)));
    assert!(guard.journal().is_empty());
    assert_eq!(guard.metrics().rollbacks_created(), 1);
}

#[tokio::test]
async fn test_custom_dependency_and_class() {
    let (guard, _clock, store) = setup(GuardConfig::default());
    let request = remove_admin(1, 7)
        .with_operation_class("stats-ops")
        .with_dependency("replica")
        .with_ttl(Duration::from_secs(5));

    let outcome = guard
        .protected_mutation(
            request,
            || async { Ok::<Value, String>(json!({ "user_id": 7, "role": "admin" })) },
            || async { Ok(()) },
        )
        .await
        .unwrap();

    assert!(guard.breakers().states().contains_key("replica"));
    let record = guard.journal().get(outcome.rollback_id).unwrap();
    assert_eq!(record.expires_at - record.created_at, Duration::from_secs(5));
    assert_eq!(store.role(7).as_deref(), Some("admin"));
}
