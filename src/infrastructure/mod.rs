//! Infrastructure layer - adapters for the application ports.
//!
//! - Clock abstraction (system time vs mock)
//! - Sharded per-key storage

pub mod clock;
pub mod storage;

pub use clock::SystemClock;
pub use storage::ShardedStorage;

/// Mock implementations for testing.
///
/// This module is only available when the `test-helpers` feature is enabled,
/// or during test builds. It provides a controllable clock, a log capture
/// layer and in-memory stores.
///
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// mutation-guard = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
