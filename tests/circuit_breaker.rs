use mutation_guard::infrastructure::mocks::{MockCaptureLayer, MockClock};
use mutation_guard::{
    BreakerError, CircuitBreakerConfig, CircuitState, GuardConfig, MutationGuard,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

fn guard() -> (MutationGuard, MockClock) {
    let clock = MockClock::new(Instant::now());
    let guard = MutationGuard::builder()
        .with_clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    (guard, clock)
}

#[tokio::test]
async fn test_always_failing_dependency_scenario() {
    let (guard, clock) = guard();
    let breaker = guard
        .breakers()
        .get("telegram", CircuitBreakerConfig::new(3, Duration::from_secs(60)));
    let invocations = AtomicU32::new(0);
    let invoked = &invocations;

    for expected in 1..=3 {
        let err = breaker
            .call(|| async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("send failed")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Inner("send failed")));
        assert_eq!(breaker.failure_count(), expected);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Fourth call is rejected without touching the dependency
    let err = breaker
        .call(|| async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("send failed")
        })
        .await
        .unwrap_err();
    assert!(err.is_open());
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_secs(61));
    let _ = breaker
        .call(|| async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("send failed")
        })
        .await;
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn test_successful_probe_closes_circuit() {
    let (guard, clock) = guard();
    let breaker = guard
        .breakers()
        .get("database", CircuitBreakerConfig::new(1, Duration::from_secs(10)));

    let _ = breaker.call(|| async { Err::<(), _>("locked") }).await;
    assert!(breaker.is_open());

    clock.advance(Duration::from_secs(10));
    assert!(!breaker.is_open());
    let value = breaker.call(|| async { Ok::<_, &str>(5) }).await.unwrap();

    assert_eq!(value, 5);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn test_only_matching_errors_count() {
    let (guard, _clock) = guard();
    let breaker = guard
        .breakers()
        .get("database", CircuitBreakerConfig::new(2, Duration::from_secs(10)));

    for _ in 0..5 {
        let _ = breaker
            .call_filtered(|| async { Err::<(), _>("constraint violation") }, |e| {
                e.contains("timeout")
            })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);

    for _ in 0..2 {
        let _ = breaker
            .call_filtered(|| async { Err::<(), _>("timeout") }, |e| {
                e.contains("timeout")
            })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn test_opening_is_logged_and_counted() {
    let (guard, _clock) = guard();
    let breaker = guard.breakers().breaker("database");
    let threshold = GuardConfig::default().breaker.failure_threshold;

    let capture = MockCaptureLayer::new();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    let _default = tracing::subscriber::set_default(subscriber);

    for _ in 0..threshold {
        let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
    }

    let warnings = capture.at_level(Level::WARN);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].message, "circuit breaker opened");
    assert_eq!(warnings[0].field("dependency"), Some("database"));
    assert_eq!(guard.metrics().breaker_trips(), 1);
}

#[tokio::test]
async fn test_registry_states_and_reset() {
    let (guard, _clock) = guard();
    let breakers = guard.breakers();
    let db = breakers.get("database", CircuitBreakerConfig::new(1, Duration::from_secs(30)));
    breakers.breaker("telegram");

    let _ = db.call(|| async { Err::<(), _>("down") }).await;

    let states = breakers.states();
    assert_eq!(states.len(), 2);
    assert_eq!(states["database"].state, CircuitState::Open);
    assert_eq!(states["telegram"].state, CircuitState::Closed);
    assert_eq!(states["database"].failure_threshold, 1);

    assert!(breakers.reset("database"));
    assert!(!breakers.reset("unknown"));
    assert_eq!(db.state(), CircuitState::Closed);
}
