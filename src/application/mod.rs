//! Application layer - the guard components and their orchestration.
//!
//! Each component owns its own interior synchronization and can be used on
//! its own:
//! - Rate limiter registry (admission per `subject:operation` key)
//! - Circuit breaker registry (one breaker per dependency)
//! - Concurrency manager (named locks and semaphores)
//! - Rollback journal (time-boxed compensating actions)
//! - Transaction log (logical transactions over a statement store)
//!
//! [`guard::MutationGuard`] wires them together around one shared
//! [`metrics::Metrics`] handle and one clock.
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters and the embedding application implement.

pub mod circuit_breaker;
pub mod concurrency;
pub mod guard;
pub mod limiter;
pub mod maintenance;
pub mod metrics;
pub mod ports;
pub mod retry;
pub mod rollback;
pub mod transaction;
