//! Circuit breaker (specification §4.4).
//!
//! One breaker exists per `{handler_name, downstream_service}` scope. The
//! registry in this module hands out a shared, thread-safe breaker per
//! scope so callers never accidentally construct two independent breakers
//! for the same logical dependency.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;
use crate::error::OmniError;

/// Circuit breaker state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Fail-fast; calls are rejected without touching downstream.
    Open,
    /// Probing; a bounded number of calls are allowed through to test
    /// recovery.
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    scope: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    fn new(scope: String, config: CircuitBreakerConfig) -> Self {
        Self {
            scope,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// The current state, recomputing `OPEN -> HALF_OPEN` if the recovery
    /// timer has elapsed (§4.4).
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_recover(&mut inner);
        inner.state
    }

    fn maybe_recover(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.recovery_timeout() {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 0;
                    tracing::info!(scope = %self.scope, "circuit breaker transitioned OPEN -> HALF_OPEN");
                }
            }
        }
    }

    /// Acquire permission to call downstream. Returns
    /// [`OmniError::CircuitOpen`] if the breaker is `OPEN`, or if `HALF_OPEN`
    /// and the concurrent-probe budget is exhausted.
    ///
    /// # Errors
    /// Returns [`OmniError::CircuitOpen`] when the call must not proceed.
    pub fn try_acquire(&self) -> Result<CircuitGuard<'_>, OmniError> {
        let mut inner = self.inner.lock();
        self.maybe_recover(&mut inner);
        match inner.state {
            CircuitState::Open => Err(OmniError::CircuitOpen { scope: self.scope.clone() }),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_attempts {
                    Err(OmniError::CircuitOpen { scope: self.scope.clone() })
                } else {
                    inner.half_open_in_flight += 1;
                    Ok(CircuitGuard { breaker: self, is_probe: true })
                }
            }
            CircuitState::Closed => Ok(CircuitGuard { breaker: self, is_probe: false }),
        }
    }

    /// Run `call` through the breaker, recording success/failure and
    /// transitioning state accordingly (§4.4).
    ///
    /// # Errors
    /// Propagates [`OmniError::CircuitOpen`] if the breaker rejects the
    /// call, or the downstream error from `call` itself.
    pub async fn call<F, Fut, T, E>(&self, call: F) -> Result<T, OmniError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Into<OmniError>,
    {
        let guard = self.try_acquire()?;
        match call().await {
            Ok(value) => {
                guard.record_success();
                Ok(value)
            }
            Err(err) => {
                let err = err.into();
                guard.record_failure();
                Err(err)
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            tracing::info!(scope = %self.scope, "circuit breaker transitioned -> CLOSED");
        }
        inner.state = CircuitState::Closed;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_in_flight = 0;
                tracing::warn!(scope = %self.scope, "circuit breaker transitioned HALF_OPEN -> OPEN");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        scope = %self.scope,
                        failures = inner.consecutive_failures,
                        "circuit breaker transitioned CLOSED -> OPEN"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Metrics snapshot for this breaker.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            scope: self.scope.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

/// A point-in-time snapshot of a breaker's state for metrics export.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// The breaker's scope name.
    pub scope: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed while `CLOSED`.
    pub consecutive_failures: u32,
}

/// An acquired permission to call downstream, which must be resolved with
/// [`CircuitGuard::record_success`] or [`CircuitGuard::record_failure`].
pub struct CircuitGuard<'a> {
    breaker: &'a CircuitBreaker,
    /// Whether this guard represents a `HALF_OPEN` probe call.
    pub is_probe: bool,
}

impl CircuitGuard<'_> {
    /// Record a successful downstream call.
    pub fn record_success(&self) {
        self.breaker.on_success();
    }

    /// Record a failed downstream call.
    pub fn record_failure(&self) {
        self.breaker.on_failure();
    }
}

/// Registry handing out one shared [`CircuitBreaker`] per scope name
/// (`"{handler_name}:{downstream_service}"`), created on first use.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Build a registry that creates breakers with `default_config` unless
    /// scope-specific configuration is added later.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { breakers: DashMap::new(), default_config }
    }

    /// Get or create the breaker for `scope`.
    #[must_use]
    pub fn get_or_create(&self, scope: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(scope) {
            return existing.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(scope.to_string(), self.default_config));
        self.breakers.insert(scope.to_string(), breaker.clone());
        breaker
    }

    /// Snapshot metrics for every breaker created so far.
    #[must_use]
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        self.breakers.iter().map(|entry| entry.value().metrics()).collect()
    }
}

/// A duration helper used by tests that need to simulate elapsed recovery
/// windows without real sleeps; not used in production code paths.
#[cfg(test)]
fn tiny_recovery_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 2,
        recovery_timeout_secs: 0,
        half_open_max_attempts: 1,
    }
}
