//! Test doubles for the infrastructure ports.
//!
//! Compiled for unit tests and behind the `test-helpers` feature.

pub mod clock;
pub mod layer;
pub mod store;

pub use clock::MockClock;
pub use layer::{CapturedEvent, MockCaptureLayer};
pub use store::{InMemoryUserStore, RecordingExecutor};
