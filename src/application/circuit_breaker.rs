//! Circuit breakers for named dependencies.
//!
//! A breaker wraps calls to one dependency (e.g. `"database"`, `"remote-api"`).
//! After `failure_threshold` consecutive counted failures it opens and rejects
//! calls without invoking them. Once `recovery_timeout` has elapsed since the
//! last failure, the next call is let through as a single probe: success
//! closes the circuit, failure reopens it.
//!
//! State transitions are evaluated lazily on call attempts. All state for one
//! breaker sits behind a short synchronous lock that is never held across the
//! wrapped future.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::metrics::Metrics;
use crate::application::ports::Clock;
use crate::config::BreakerSettings;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls pass through and failures are counted
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// One probe call decides whether to close or reopen
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration to wait after the last failure before probing
    pub recovery_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Create a configuration.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        BreakerSettings::default().into()
    }
}

impl From<BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: BreakerSettings) -> Self {
        Self::new(settings.failure_threshold, settings.recovery_timeout)
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The call was rejected without invoking the dependency
    #[error("circuit breaker '{name}' is open, retry in {:.1}s", .retry_after.as_secs_f64())]
    Open {
        /// Dependency name
        name: String,
        /// Time until a probe is allowed
        retry_after: Duration,
    },
    /// The dependency was invoked and failed
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Check if the call was rejected by an open circuit.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The dependency error, if the dependency was invoked.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Dependency name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive counted failures
    pub failure_count: u32,
    /// Failures that open the circuit
    pub failure_threshold: u32,
    /// Open duration before probing
    pub recovery_timeout: Duration,
    /// Time since the last counted failure
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker protecting one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
            clock,
            metrics,
        }
    }

    /// Run `op` through the breaker. Every error counts as a failure.
    ///
    /// # Errors
    /// [`BreakerError::Open`] when the call was rejected, [`BreakerError::Inner`]
    /// with the dependency's own error otherwise.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(op, |_| true).await
    }

    /// Run `op` through the breaker, counting only errors for which `counts` is true.
    ///
    /// Errors that do not count are returned unchanged and leave the failure
    /// count untouched.
    pub async fn call_filtered<F, Fut, T, E, P>(
        &self,
        op: F,
        counts: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut guard = self.admit::<E>()?;
        let result = op().await;
        guard.settled = true;
        let probe = guard.probe;

        match result {
            Ok(value) => {
                self.on_success(probe);
                Ok(value)
            }
            Err(e) if counts(&e) => {
                self.on_failure(probe);
                Err(BreakerError::Inner(e))
            }
            Err(e) => {
                self.on_neutral(probe);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Check if calls are currently being rejected.
    ///
    /// An open circuit whose recovery timeout has elapsed reports `false`,
    /// since the next call would be admitted as a probe.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        match state.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => state.probe_in_flight,
            CircuitState::Open => self.remaining_open(&state).is_some(),
        }
    }

    /// Current state, without evaluating a pending transition.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Consecutive counted failures.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.last_failure = None;
        state.probe_in_flight = false;
        info!(dependency = %self.name, "circuit breaker reset");
    }

    /// Point-in-time view for observability.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let state = self.state.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout,
            since_last_failure: state
                .last_failure
                .map(|at| now.saturating_duration_since(at)),
        }
    }

    /// Dependency name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Applied configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn remaining_open(&self, state: &BreakerState) -> Option<Duration> {
        let last_failure = state.last_failure?;
        let elapsed = self.clock.now().saturating_duration_since(last_failure);
        let remaining = self.config.recovery_timeout.saturating_sub(elapsed);
        (!remaining.is_zero()).then_some(remaining)
    }

    fn admit<E>(&self) -> Result<CallGuard<'_>, BreakerError<E>> {
        let mut state = self.state.lock();
        let current = state.state;
        match current {
            CircuitState::Closed => Ok(CallGuard::new(self, false)),
            CircuitState::Open => match self.remaining_open(&state) {
                Some(retry_after) => {
                    drop(state);
                    Err(self.reject(retry_after))
                }
                None => {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    info!(dependency = %self.name, "circuit breaker half-open, probing");
                    Ok(CallGuard::new(self, true))
                }
            },
            CircuitState::HalfOpen if state.probe_in_flight => {
                drop(state);
                Err(self.reject(Duration::ZERO))
            }
            CircuitState::HalfOpen => {
                state.probe_in_flight = true;
                Ok(CallGuard::new(self, true))
            }
        }
    }

    fn reject<E>(&self, retry_after: Duration) -> BreakerError<E> {
        self.metrics.record_breaker_rejection();
        debug!(
            dependency = %self.name,
            retry_after_secs = retry_after.as_secs_f64(),
            "call rejected by open circuit"
        );
        BreakerError::Open {
            name: self.name.clone(),
            retry_after,
        }
    }

    // Only the trial call may leave HALF_OPEN; calls admitted before the circuit
    // opened settle without moving it
    fn on_success(&self, probe: bool) {
        let mut state = self.state.lock();
        let current = state.state;
        match current {
            CircuitState::HalfOpen if probe => {
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.probe_in_flight = false;
                info!(dependency = %self.name, "circuit breaker closed after successful probe");
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::Open | CircuitState::HalfOpen => {
                debug!(dependency = %self.name, state = %current, "late success ignored");
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut state = self.state.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure = Some(self.clock.now());

        let current = state.state;
        let should_open = match current {
            CircuitState::HalfOpen if probe => {
                state.probe_in_flight = false;
                true
            }
            CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
            CircuitState::Open | CircuitState::HalfOpen => false,
        };
        if should_open {
            state.state = CircuitState::Open;
            self.metrics.record_breaker_trip();
            warn!(
                dependency = %self.name,
                failures = state.failure_count,
                "circuit breaker opened"
            );
        }
    }

    fn on_neutral(&self, probe: bool) {
        if probe {
            self.state.lock().probe_in_flight = false;
        }
    }
}

// Clears an abandoned probe so a dropped future cannot wedge the breaker half-open
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CallGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_neutral(self.probe);
        }
    }
}

/// Map of dependency name to breaker, created on first reference.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            defaults,
            clock,
            metrics,
        }
    }

    /// Get the breaker for `name`, creating it with `config` on first reference.
    ///
    /// Later calls return the existing breaker and ignore `config`.
    pub fn get(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(dependency = name, "creating circuit breaker");
            Arc::new(CircuitBreaker::new(
                name,
                config,
                Arc::clone(&self.clock),
                self.metrics.clone(),
            ))
        });
        Arc::clone(breaker)
    }

    /// Get the breaker for `name` with the registry defaults.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get(name, self.defaults)
    }

    /// Reset one breaker. Returns `false` if it was never created.
    pub fn reset(&self, name: &str) -> bool {
        let breaker = self.breakers.lock().get(name).cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Snapshot of every breaker, keyed by name.
    pub fn states(&self) -> BTreeMap<String, BreakerSnapshot> {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        breakers
            .iter()
            .map(|breaker| (breaker.name().to_string(), breaker.snapshot()))
            .collect()
    }
}
