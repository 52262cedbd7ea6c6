//! Domain layer - pure types and decisions with no I/O and no async.
//!
//! - Sliding-window admission state
//! - Retry backoff schedules
//! - Rollback records
//! - Logical transaction records
//!
//! Everything here takes the current instant as an argument, so it is
//! tested without a clock.

pub mod backoff;
pub mod rate_limit;
pub mod rollback;
pub mod transaction;
