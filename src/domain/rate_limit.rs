//! Sliding-window admission with burst protection and cooldown.
//!
//! A [`KeyWindow`] is the state tracked for one `subject:operation` key. It
//! keeps two ordered sequences of admitted timestamps: one bounded by the
//! configured time window and a shorter one bounded by [`BURST_WINDOW`].
//! Any denial starts (or refreshes) a cooldown during which every request for
//! the key is rejected.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::{check_bound, duration_secs, ConfigError};

/// Width of the short window used for burst detection.
pub const BURST_WINDOW: Duration = Duration::from_secs(5);

/// Limits for one logical operation class (e.g. `admin-ops`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum admitted requests inside `time_window`
    pub max_requests: usize,
    /// Length of the sliding window
    #[serde(with = "duration_secs")]
    pub time_window: Duration,
    /// Maximum admitted requests inside [`BURST_WINDOW`]
    pub burst_limit: usize,
    /// How long a key stays rejected after a violation
    #[serde(with = "duration_secs")]
    pub cooldown_period: Duration,
}

impl RateLimitConfig {
    /// Create a validated configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if any limit or the window is zero.
    pub fn new(
        max_requests: usize,
        time_window: Duration,
        burst_limit: usize,
        cooldown_period: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            max_requests,
            time_window,
            burst_limit,
            cooldown_period,
        };
        config.validate()?;
        Ok(config)
    }

    /// Limits for destructive administrative actions.
    pub const fn admin_ops() -> Self {
        Self {
            max_requests: 5,
            time_window: Duration::from_secs(60),
            burst_limit: 2,
            cooldown_period: Duration::from_secs(30),
        }
    }

    /// Limits for statistics queries.
    pub const fn stats_ops() -> Self {
        Self {
            max_requests: 20,
            time_window: Duration::from_secs(60),
            burst_limit: 5,
            cooldown_period: Duration::from_secs(15),
        }
    }

    /// Limits for raw store operations.
    pub const fn db_ops() -> Self {
        Self {
            max_requests: 100,
            time_window: Duration::from_secs(60),
            burst_limit: 20,
            cooldown_period: Duration::from_secs(10),
        }
    }

    /// Check the configuration for values that would deny everything.
    ///
    /// # Errors
    /// Returns [`ConfigError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::Zero("max_requests"));
        }
        if self.burst_limit == 0 {
            return Err(ConfigError::Zero("burst_limit"));
        }
        if self.time_window.is_zero() {
            return Err(ConfigError::Zero("time_window"));
        }
        check_bound("time_window", self.time_window)?;
        check_bound("cooldown_period", self.cooldown_period)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            time_window: Duration::from_secs(60),
            burst_limit: 5,
            cooldown_period: Duration::from_secs(30),
        }
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// A previous violation put the key into cooldown
    Cooldown {
        /// Time left until the cooldown ends
        remaining: Duration,
    },
    /// Too many requests inside the burst window
    BurstLimit,
    /// Too many requests inside the main window
    RateLimit,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::Cooldown { remaining } => write!(
                f,
                "Rate limit cooldown active, {:.1}s remaining",
                remaining.as_secs_f64()
            ),
            DenialReason::BurstLimit => f.write_str("Burst limit exceeded"),
            DenialReason::RateLimit => f.write_str("Rate limit exceeded"),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request was admitted and recorded
    Allowed,
    /// The request was rejected; nothing was recorded
    Denied {
        /// Why the request was rejected
        reason: DenialReason,
        /// Earliest moment a retry can succeed
        retry_after: Duration,
    },
}

impl Admission {
    /// Check if the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// The denial reason, if any.
    pub fn reason(&self) -> Option<DenialReason> {
        match self {
            Admission::Allowed => None,
            Admission::Denied { reason, .. } => Some(*reason),
        }
    }
}

/// Per-key admission state.
#[derive(Debug, Clone, Default)]
pub struct KeyWindow {
    requests: VecDeque<Instant>,
    burst: VecDeque<Instant>,
    cooldown_started: Option<Instant>,
}

impl KeyWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop timestamps that fell out of either window.
    pub fn purge(&mut self, config: &RateLimitConfig, now: Instant) {
        expire(&mut self.requests, config.time_window, now);
        expire(&mut self.burst, BURST_WINDOW, now);
    }

    /// Time left in the current cooldown, if one is active.
    pub fn cooldown_remaining(&self, config: &RateLimitConfig, now: Instant) -> Option<Duration> {
        let started = self.cooldown_started?;
        let elapsed = now.saturating_duration_since(started);
        if elapsed < config.cooldown_period {
            Some(config.cooldown_period - elapsed)
        } else {
            None
        }
    }

    /// Decide whether a request at `now` is admitted, recording it if so.
    pub fn register(&mut self, config: &RateLimitConfig, now: Instant) -> Admission {
        self.purge(config, now);

        if let Some(remaining) = self.cooldown_remaining(config, now) {
            return Admission::Denied {
                reason: DenialReason::Cooldown { remaining },
                retry_after: remaining,
            };
        }

        let reason = if self.burst.len() >= config.burst_limit {
            Some(DenialReason::BurstLimit)
        } else if self.requests.len() >= config.max_requests {
            Some(DenialReason::RateLimit)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.cooldown_started = Some(now);
            return Admission::Denied {
                reason,
                retry_after: config.cooldown_period,
            };
        }

        self.cooldown_started = None;
        self.requests.push_back(now);
        self.burst.push_back(now);
        Admission::Allowed
    }

    /// Number of admitted requests still inside the main window.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Number of admitted requests still inside the burst window.
    pub fn burst_count(&self) -> usize {
        self.burst.len()
    }

    /// True when the key holds no live timestamps and no cooldown.
    pub fn is_idle(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        self.purge(config, now);
        self.requests.is_empty()
            && self.burst.is_empty()
            && self.cooldown_remaining(config, now).is_none()
    }
}

fn expire(timestamps: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(&oldest) = timestamps.front() {
        if now.saturating_duration_since(oldest) > window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> RateLimitConfig {
        RateLimitConfig::new(5, Duration::from_secs(60), 2, Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn test_burst_limit_then_recovery_after_cooldown() {
        let config = admin();
        let mut window = KeyWindow::new();
        let start = Instant::now();

        assert!(window.register(&config, start).is_allowed());
        assert!(window
            .register(&config, start + Duration::from_millis(500))
            .is_allowed());

        let third = window.register(&config, start + Duration::from_secs(1));
        assert_eq!(third.reason(), Some(DenialReason::BurstLimit));
        assert_eq!(third.reason().unwrap().to_string(), "Burst limit exceeded");

        // Still cooling down one second before the end
        let early = window.register(&config, start + Duration::from_secs(30));
        assert!(matches!(
            early.reason(),
            Some(DenialReason::Cooldown { .. })
        ));

        assert!(window
            .register(&config, start + Duration::from_secs(31))
            .is_allowed());
    }

    #[test]
    fn test_rate_limit_exceeded_within_window() {
        let config =
            RateLimitConfig::new(3, Duration::from_secs(60), 10, Duration::from_secs(5)).unwrap();
        let mut window = KeyWindow::new();
        let start = Instant::now();

        for i in 0..3 {
            let at = start + Duration::from_secs(i * 6);
            assert!(window.register(&config, at).is_allowed(), "request {}", i);
        }

        let denied = window.register(&config, start + Duration::from_secs(20));
        assert_eq!(denied.reason(), Some(DenialReason::RateLimit));
        assert_eq!(window.request_count(), 3);
    }

    #[test]
    fn test_window_never_exceeds_max_requests() {
        let config =
            RateLimitConfig::new(4, Duration::from_secs(10), 100, Duration::ZERO).unwrap();
        let mut window = KeyWindow::new();
        let start = Instant::now();

        for i in 0..200u64 {
            window.register(&config, start + Duration::from_millis(i * 300));
            assert!(window.request_count() <= config.max_requests);
            assert!(window.burst_count() <= config.burst_limit);
        }
    }

    #[test]
    fn test_cooldown_message_includes_remaining_seconds() {
        let config = admin();
        let mut window = KeyWindow::new();
        let start = Instant::now();

        window.register(&config, start);
        window.register(&config, start);
        window.register(&config, start);

        let denied = window.register(&config, start + Duration::from_secs(10));
        assert_eq!(
            denied.reason().unwrap().to_string(),
            "Rate limit cooldown active, 20.0s remaining"
        );
        match denied {
            Admission::Denied { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(20))
            }
            Admission::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn test_denial_during_cooldown_does_not_extend_it() {
        let config = admin();
        let mut window = KeyWindow::new();
        let start = Instant::now();

        window.register(&config, start);
        window.register(&config, start);
        window.register(&config, start); // cooldown starts at `start`

        for s in 1..30 {
            assert!(!window
                .register(&config, start + Duration::from_secs(s))
                .is_allowed());
        }
        assert!(window
            .register(&config, start + Duration::from_secs(30))
            .is_allowed());
    }

    #[test]
    fn test_idle_detection() {
        let config = admin();
        let mut window = KeyWindow::new();
        let start = Instant::now();

        assert!(window.is_idle(&config, start));
        window.register(&config, start);
        assert!(!window.is_idle(&config, start + Duration::from_secs(1)));
        assert!(window.is_idle(&config, start + Duration::from_secs(61)));
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            RateLimitConfig::new(0, Duration::from_secs(1), 1, Duration::ZERO),
            Err(ConfigError::Zero("max_requests"))
        ));
        assert!(matches!(
            RateLimitConfig::new(1, Duration::ZERO, 1, Duration::ZERO),
            Err(ConfigError::Zero("time_window"))
        ));
        assert!(RateLimitConfig::admin_ops().validate().is_ok());
    }
}
