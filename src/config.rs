//! Configuration for every guard component.
//!
//! All durations are expressed in seconds (fractions allowed) when loaded from
//! JSON. Every field has a default, so a partial document is valid:
//!
//! ```
//! use mutation_guard::GuardConfig;
//!
//! let config = GuardConfig::from_json_str(r#"{
//!     "rate_limits": {
//!         "admin-ops": { "max_requests": 3, "time_window": 60, "burst_limit": 1, "cooldown_period": 10 }
//!     },
//!     "breaker": { "failure_threshold": 3 }
//! }"#).unwrap();
//!
//! assert_eq!(config.rate_limits["admin-ops"].max_requests, 3);
//! assert_eq!(config.breaker.failure_threshold, 3);
//! assert_eq!(config.rollback.default_ttl.as_secs(), 3600);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::domain::backoff::BackoffPolicy;
use crate::domain::rate_limit::RateLimitConfig;

/// Operation class for destructive administrative actions.
pub const ADMIN_OPS: &str = "admin-ops";
/// Operation class for statistics queries.
pub const STATS_OPS: &str = "stats-ops";
/// Operation class for raw store access.
pub const DB_OPS: &str = "db-ops";

/// Upper bound for every configured duration (ten years).
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Error returned when configuration validation fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field that must be positive was zero
    #[error("{0} must be greater than 0")]
    Zero(&'static str),
    /// A duration exceeded [`MAX_DURATION`]
    #[error("{0} must not exceed {max} seconds", max = MAX_DURATION.as_secs())]
    TooLong(&'static str),
    /// A field had an out-of-range value
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// What was wrong
        reason: String,
    },
    /// The document could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Circuit breaker defaults applied to dependencies without explicit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Named lock and semaphore settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    /// Acquisition timeout when the caller does not pass one
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,
    /// Cap on the number of distinct named locks
    pub max_locks: usize,
    /// Holders older than this are force-released by maintenance
    #[serde(with = "duration_secs")]
    pub stale_lock_age: Duration,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_locks: 1000,
            stale_lock_age: Duration::from_secs(300),
        }
    }
}

/// Rollback journal settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackSettings {
    /// Undo window for destructive admin actions
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
    /// Undo window for metadata-only changes
    #[serde(with = "duration_secs")]
    pub metadata_ttl: Duration,
    /// Minimum spacing between opportunistic expiry sweeps
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
}

impl Default for RollbackSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            metadata_ttl: Duration::from_secs(1800),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Transaction log settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// Timeout for transactions started without an explicit one
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,
    /// Minimum spacing between opportunistic stale sweeps
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Background maintenance settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    /// Tick period of the maintenance task
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration for a [`MutationGuard`](crate::MutationGuard).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Admission limits per operation class
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    /// Circuit breaker defaults
    pub breaker: BreakerSettings,
    /// Lock and semaphore settings
    pub concurrency: ConcurrencySettings,
    /// Rollback journal settings
    pub rollback: RollbackSettings,
    /// Transaction log settings
    pub transactions: TransactionSettings,
    /// Retry schedule for flaky dependency calls
    pub retry: BackoffPolicy,
    /// Background maintenance settings
    pub maintenance: MaintenanceSettings,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let rate_limits = BTreeMap::from([
            (ADMIN_OPS.to_string(), RateLimitConfig::admin_ops()),
            (STATS_OPS.to_string(), RateLimitConfig::stats_ops()),
            (DB_OPS.to_string(), RateLimitConfig::db_ops()),
        ]);
        Self {
            rate_limits,
            breaker: BreakerSettings::default(),
            concurrency: ConcurrencySettings::default(),
            rollback: RollbackSettings::default(),
            transactions: TransactionSettings::default(),
            retry: BackoffPolicy::default(),
            maintenance: MaintenanceSettings::default(),
        }
    }
}

impl GuardConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed input and any validation error.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for limits in self.rate_limits.values() {
            limits.validate()?;
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure_threshold"));
        }
        if self.concurrency.max_locks == 0 {
            return Err(ConfigError::Zero("max_locks"));
        }
        if self.concurrency.default_timeout.is_zero() {
            return Err(ConfigError::Zero("default_timeout"));
        }
        if self.rollback.default_ttl.is_zero() || self.rollback.metadata_ttl.is_zero() {
            return Err(ConfigError::Zero("rollback ttl"));
        }
        if self.transactions.default_timeout.is_zero() {
            return Err(ConfigError::Zero("transaction timeout"));
        }
        if self.maintenance.interval.is_zero() {
            return Err(ConfigError::Zero("maintenance interval"));
        }
        for (field, value) in [
            ("recovery_timeout", self.breaker.recovery_timeout),
            ("default_timeout", self.concurrency.default_timeout),
            ("stale_lock_age", self.concurrency.stale_lock_age),
            ("default_ttl", self.rollback.default_ttl),
            ("metadata_ttl", self.rollback.metadata_ttl),
            ("cleanup_interval", self.rollback.cleanup_interval),
            ("transaction timeout", self.transactions.default_timeout),
            ("sweep_interval", self.transactions.sweep_interval),
            ("maintenance interval", self.maintenance.interval),
        ] {
            check_bound(field, value)?;
        }
        self.retry.validate()
    }
}

/// Reject durations above [`MAX_DURATION`].
///
/// # Errors
/// [`ConfigError::TooLong`] naming `field`.
pub fn check_bound(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value > MAX_DURATION {
        return Err(ConfigError::TooLong(field));
    }
    Ok(())
}

/// Serde adapter for durations written as (fractional) seconds.
pub mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as seconds.
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Deserialize a duration from non-negative seconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limits[ADMIN_OPS], RateLimitConfig::admin_ops());
        assert_eq!(config.rate_limits[DB_OPS], RateLimitConfig::db_ops());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let result = GuardConfig::from_json_str(r#"{"rollback": {"default_ttl": 1e18}}"#);
        assert_eq!(result, Err(ConfigError::TooLong("default_ttl")));

        let result = GuardConfig::from_json_str(r#"{"concurrency": {"default_timeout": 1e12}}"#);
        assert_eq!(result, Err(ConfigError::TooLong("default_timeout")));

        let result = GuardConfig::from_json_str(
            r#"{"rate_limits": {"x": {"max_requests": 1, "time_window": 1e15, "burst_limit": 1, "cooldown_period": 0}}}"#,
        );
        assert_eq!(result, Err(ConfigError::TooLong("time_window")));

        let result = GuardConfig::from_json_str(r#"{"retry": {"max_attempts": 3, "base_delay": 1, "factor": 2.0, "max_delay": 1e15}}"#);
        assert_eq!(result, Err(ConfigError::TooLong("max_delay")));

        let at_limit = format!(r#"{{"rollback": {{"default_ttl": {}}}}}"#, MAX_DURATION.as_secs());
        assert!(GuardConfig::from_json_str(&at_limit).is_ok());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = GuardConfig::from_json_str(r#"{"rollback": {"default_ttl": 10.5}}"#).unwrap();
        assert_eq!(config.rollback.default_ttl, Duration::from_millis(10_500));
        assert_eq!(config.rollback.metadata_ttl, Duration::from_secs(1800));
        assert_eq!(config.breaker, BreakerSettings::default());
    }

    #[test]
    fn test_negative_duration_rejected() {
        let result = GuardConfig::from_json_str(r#"{"maintenance": {"interval": -1}}"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let result = GuardConfig::from_json_str(r#"{"breaker": {"failure_threshold": 0}}"#);
        assert_eq!(result, Err(ConfigError::Zero("failure_threshold")));
    }

    #[test]
    fn test_invalid_rate_limit_rejected() {
        let result = GuardConfig::from_json_str(
            r#"{"rate_limits": {"x": {"max_requests": 0, "time_window": 1, "burst_limit": 1, "cooldown_period": 0}}}"#,
        );
        assert_eq!(result, Err(ConfigError::Zero("max_requests")));
    }
}
