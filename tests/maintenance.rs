use mutation_guard::infrastructure::mocks::{MockCaptureLayer, MockClock};
use mutation_guard::{GuardConfig, IsolationHint, MaintenanceSettings, MutationGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

fn guard(interval: Duration) -> (MutationGuard, MockClock) {
    let clock = MockClock::new(Instant::now());
    let config = GuardConfig {
        maintenance: MaintenanceSettings { interval },
        ..GuardConfig::default()
    };
    let guard = MutationGuard::builder()
        .with_config(config)
        .with_clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    (guard, clock)
}

#[tokio::test(start_paused = true)]
async fn test_background_task_sweeps_until_shutdown() {
    let (guard, clock) = guard(Duration::from_secs(30));
    let capture = MockCaptureLayer::new();
    let _default =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    let handle = guard.start_maintenance();

    guard
        .journal()
        .create_role_change(1, "admin", "user", Some(Duration::from_secs(5)));
    guard
        .transactions()
        .begin(Some(Duration::from_secs(5)), IsolationHint::default());
    guard.limiters().limiter("admin-ops").is_allowed("1:remove_admin");
    clock.advance(Duration::from_secs(120));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(guard.journal().is_empty());
    assert!(guard.transactions().active().is_empty());
    assert_eq!(guard.limiters().limiter("admin-ops").tracked_keys(), 0);

    let pass = capture
        .at_level(Level::INFO)
        .into_iter()
        .find(|event| event.message == "maintenance pass")
        .expect("maintenance pass logged");
    assert_eq!(pass.field("rollbacks_expired"), Some("1"));
    assert_eq!(pass.field("transactions_swept"), Some("1"));
    assert_eq!(pass.field("idle_keys_removed"), Some("1"));

    assert!(!handle.is_finished());
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_stops_task() {
    let (guard, clock) = guard(Duration::from_secs(10));
    let handle = guard.start_maintenance();
    drop(handle);

    guard
        .journal()
        .create_role_change(1, "admin", "user", Some(Duration::from_secs(1)));
    clock.advance(Duration::from_secs(5));
    tokio::time::sleep(Duration::from_secs(30)).await;

    // Nothing swept it; the record is only expired
    assert_eq!(guard.journal().len(), 1);
}

#[test]
fn test_manual_pass_on_empty_guard() {
    let (guard, _clock) = guard(Duration::from_secs(30));
    assert_eq!(guard.run_maintenance().total(), 0);
}
