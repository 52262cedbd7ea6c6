//! Exponential backoff schedule for retrying flaky dependency calls.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{check_bound, duration_secs, ConfigError};

/// Capped exponential backoff: `base_delay * factor^attempt`, never above `max_delay`.
///
/// # Example
/// ```
/// use mutation_guard::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::new(4, Duration::from_secs(1), 2.0, Duration::from_secs(3)).unwrap();
/// let delays: Vec<_> = policy.delays().collect();
/// assert_eq!(
///     delays,
///     vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3)]
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub factor: f64,
    /// Upper bound for any single delay
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Create a validated policy.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if `max_attempts` is zero or `factor` is below 1.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        factor: f64,
        max_delay: Duration,
    ) -> Result<Self, ConfigError> {
        let policy = Self {
            max_attempts,
            base_delay,
            factor,
            max_delay,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Check the policy fields.
    ///
    /// # Errors
    /// Returns [`ConfigError`] describing the invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "factor",
                reason: "must be a finite number >= 1.0".to_string(),
            });
        }
        check_bound("base_delay", self.base_delay)?;
        check_bound("max_delay", self.max_delay)
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delays between consecutive attempts (one fewer than `max_attempts`).
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|attempt| self.delay_for(attempt))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}
