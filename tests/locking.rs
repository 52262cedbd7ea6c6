use mutation_guard::infrastructure::mocks::{MockCaptureLayer, MockClock};
use mutation_guard::{ConcurrencyError, ConcurrencySettings, GuardConfig, LockKind, MutationGuard};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

#[tokio::test(start_paused = true)]
async fn test_two_holders_serialize() {
    let guard = MutationGuard::builder().build().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let (entered_tx, entered_rx) = oneshot::channel();

    let first = {
        let locks = guard.locks().clone();
        let events = Arc::clone(&events);
        tokio::spawn(async move {
            let _lock = locks.with_lock("user:7", None, false).await.unwrap();
            events.lock().unwrap().push("first-enter");
            entered_tx.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            events.lock().unwrap().push("first-exit");
        })
    };

    entered_rx.await.unwrap();
    let _lock = guard
        .locks()
        .with_lock("user:7", Some(Duration::from_secs(1)), false)
        .await
        .unwrap();
    events.lock().unwrap().push("second-enter");

    first.await.unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec!["first-enter", "first-exit", "second-enter"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_holder_past_timeout_fails_waiter() {
    let guard = MutationGuard::builder().build().unwrap();
    let capture = MockCaptureLayer::new();
    let _default =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    let held = guard.locks().with_lock("user:7", None, false).await.unwrap();
    let err = guard
        .locks()
        .with_lock("user:7", Some(Duration::from_secs(1)), false)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ConcurrencyError::LockTimeout {
            name: "user:7".to_string(),
            timeout: Duration::from_secs(1),
        }
    );
    assert!(capture.contains(Level::WARN, "acquisition timed out"));
    assert_eq!(guard.metrics().lock_timeouts(), 1);
    assert_eq!(guard.locks().stats().per_name["user:7"].timeouts, 1);

    drop(held);
    assert!(guard.locks().acquire("user:7", Some(Duration::from_secs(1)), false).await);
    assert!(guard.locks().release("user:7"));
}

#[tokio::test(start_paused = true)]
async fn test_shared_and_exclusive_namespaces_are_separate() {
    let guard = MutationGuard::builder().build().unwrap();
    let locks = guard.locks();

    let exclusive = locks.with_lock("mailbox:3", None, false).await.unwrap();
    let reader_a = locks.with_lock("mailbox:3", None, true).await.unwrap();
    let reader_b = locks.with_lock("mailbox:3", None, true).await.unwrap();

    assert_eq!(exclusive.kind(), LockKind::Exclusive);
    assert_eq!(reader_a.kind(), LockKind::Shared);
    let stats = locks.stats();
    assert_eq!(stats.total_locks, 1);
    assert_eq!(stats.total_shared_locks, 1);
    assert_eq!(stats.active.len(), 3);

    drop((exclusive, reader_a, reader_b));
    assert!(locks.stats().active.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_semaphore_bounds_concurrent_lookups() {
    let guard = MutationGuard::builder().build().unwrap();
    let locks = guard.locks();
    let timeout = Some(Duration::from_millis(100));

    let a = locks.with_semaphore("username-lookup", 2, timeout).await.unwrap();
    let _b = locks.with_semaphore("username-lookup", 2, timeout).await.unwrap();
    let err = locks
        .with_semaphore("username-lookup", 2, timeout)
        .await
        .unwrap_err();
    assert!(matches!(err, ConcurrencyError::SemaphoreTimeout { .. }));

    drop(a);
    assert!(locks.acquire_semaphore("username-lookup", 2, timeout).await);
    assert!(locks.release_semaphore("username-lookup"));
}

#[tokio::test]
async fn test_capacity_and_stale_cleanup() {
    let clock = MockClock::new(Instant::now());
    let config = GuardConfig {
        concurrency: ConcurrencySettings {
            max_locks: 2,
            ..ConcurrencySettings::default()
        },
        ..GuardConfig::default()
    };
    let guard = MutationGuard::builder()
        .with_config(config)
        .with_clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let locks = guard.locks();

    assert!(locks.acquire("a", None, false).await);
    assert!(locks.acquire("b", None, false).await);
    assert_eq!(
        locks.try_acquire("c", None, false).await.unwrap_err(),
        ConcurrencyError::CapacityExceeded { max: 2 }
    );

    clock.advance(Duration::from_secs(301));
    let report = guard.run_maintenance();
    assert_eq!(report.stale_locks_released, 2);
    assert_eq!(locks.stats().per_name["a"].deadlocks, 1);
    assert_eq!(guard.metrics().stale_locks_released(), 2);
    assert!(locks.acquire("a", None, false).await);
}

#[tokio::test]
async fn test_capacity_counts_only_names_in_use() {
    let config = GuardConfig {
        concurrency: ConcurrencySettings {
            max_locks: 2,
            ..ConcurrencySettings::default()
        },
        ..GuardConfig::default()
    };
    let guard = MutationGuard::new(config).unwrap();
    let locks = guard.locks();

    for user in 1..=10 {
        let held = locks
            .with_lock(&format!("user:{}", user), None, false)
            .await
            .unwrap();
        drop(held);
    }
    assert!(locks.stats().active.is_empty());
    assert_eq!(locks.stats().total_locks, 0);

    let a = locks.with_lock("user:11", None, false).await.unwrap();
    let b = locks.with_lock("user:12", None, false).await.unwrap();
    assert_eq!(
        locks.try_acquire("user:13", None, false).await.unwrap_err(),
        ConcurrencyError::CapacityExceeded { max: 2 }
    );
    drop(a);
    assert!(locks.with_lock("user:13", None, false).await.is_ok());
    drop(b);
}

#[tokio::test]
async fn test_shutdown_rejects_new_acquisitions() {
    let guard = MutationGuard::builder().build().unwrap();
    let held = guard.locks().with_lock("x", None, false).await.unwrap();

    guard.locks().shutdown();
    assert_eq!(
        guard.locks().try_acquire("x", None, false).await.unwrap_err(),
        ConcurrencyError::ShutDown
    );
    assert!(guard.locks().stats().active.is_empty());
    drop(held);
}
