//! # Circuit Breaker Implementation
//!
//! Fault isolation for the backing store. Three states:
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are refused without touching the resource until the
//!   cooldown elapses.
//! - **HalfOpen**: exactly one trial call is in flight. Success closes the
//!   circuit and resets the cooldown; failure reopens it with an extended
//!   cooldown. A trial whose future is dropped reopens the circuit with the
//!   cooldown unchanged.
//!
//! State lives behind a synchronous lock that is never held across an await,
//! so the same breaker serves async and sync callers.

use crate::logging::duration_ms;
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - a single trial call is allowed
    HalfOpen = 2,
}

/// Errors returned from a guarded call
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Refused without invoking the action
    #[error("Circuit breaker is open for {component}, retry in {retry_after:?}")]
    CircuitOpen {
        component: String,
        retry_after: Duration,
    },

    /// The action ran and failed
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    metrics: CircuitBreakerMetrics,
}

/// Breaker guarding one protected resource
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission ticket for one call. Dropping an unsettled trial permit counts as
/// an abandoned trial.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn settle(mut self, success: bool, duration: Duration) {
        self.settled = true;
        self.breaker.record(self.trial, success, duration);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial();
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            cooldown_ms = duration_ms(config.cooldown),
            max_cooldown_ms = duration_ms(config.max_cooldown),
            "🛡️ Circuit breaker initialized"
        );

        Self {
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                cooldown: config.cooldown,
                trial_in_flight: false,
                metrics: CircuitBreakerMetrics::new(config.cooldown),
            }),
            name,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Remaining cooldown while open, `None` when calls would be admitted
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => None,
            CircuitState::HalfOpen if !inner.trial_in_flight => None,
            CircuitState::HalfOpen => Some(inner.cooldown),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                inner.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
            }
        }
    }

    /// Run an async action, counting every error as a failure
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(operation, |_| true).await
    }

    /// Run an async action; only errors for which `is_failure` holds count
    /// toward tripping the circuit
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        is_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let permit = self.admit()?;
        let started = Instant::now();
        let result = operation().await;
        let success = result.as_ref().err().map_or(true, |e| !is_failure(e));
        permit.settle(success, started.elapsed());
        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Synchronous variant of [`CircuitBreaker::call`]
    pub fn call_sync<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let permit = self.admit()?;
        let started = Instant::now();
        let result = operation();
        permit.settle(result.is_ok(), started.elapsed());
        result.map_err(CircuitBreakerError::OperationFailed)
    }

    fn admit<E>(&self) -> Result<CallPermit<'_>, CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(self.permit(true))
            }
            CircuitState::HalfOpen => {
                inner.metrics.rejected_count += 1;
                Err(self.open_error(inner.cooldown))
            }
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(
                        component = %self.name,
                        cooldown_ms = duration_ms(inner.cooldown),
                        "🟡 Circuit breaker half-open (admitting trial call)"
                    );
                    Ok(self.permit(true))
                } else {
                    inner.metrics.rejected_count += 1;
                    Err(self.open_error(inner.cooldown - elapsed))
                }
            }
        }
    }

    fn permit(&self, trial: bool) -> CallPermit<'_> {
        CallPermit {
            breaker: self,
            trial,
            settled: false,
        }
    }

    fn open_error<E>(&self, retry_after: Duration) -> CircuitBreakerError<E> {
        CircuitBreakerError::CircuitOpen {
            component: self.name.clone(),
            retry_after,
        }
    }

    fn record(&self, trial: bool, success: bool, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.total_duration += duration;

        if success {
            inner.metrics.success_count += 1;
            inner.metrics.consecutive_failures = 0;
            if trial {
                inner.trial_in_flight = false;
                inner.cooldown = self.config.cooldown;
                Self::transition(&mut inner, CircuitState::Closed);
                info!(
                    component = %self.name,
                    total_calls = inner.metrics.total_calls,
                    "🟢 Circuit breaker closed (recovered)"
                );
            }
            return;
        }

        inner.metrics.failure_count += 1;
        inner.metrics.consecutive_failures += 1;
        debug!(
            component = %self.name,
            duration_ms = duration_ms(duration),
            consecutive_failures = inner.metrics.consecutive_failures,
            "🔴 Guarded operation failed"
        );

        if trial {
            inner.trial_in_flight = false;
            inner.cooldown = self.config.extend(inner.cooldown);
            Self::transition(&mut inner, CircuitState::Open);
            error!(
                component = %self.name,
                cooldown_ms = duration_ms(inner.cooldown),
                "🔴 Circuit breaker trial failed, reopened with extended cooldown"
            );
        } else if inner.state == CircuitState::Closed
            && inner.metrics.consecutive_failures >= u64::from(self.config.failure_threshold)
        {
            Self::transition(&mut inner, CircuitState::Open);
            error!(
                component = %self.name,
                consecutive_failures = inner.metrics.consecutive_failures,
                failure_threshold = self.config.failure_threshold,
                cooldown_ms = duration_ms(inner.cooldown),
                "🔴 Circuit breaker opened (failing fast)"
            );
        }
    }

    fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if !inner.trial_in_flight {
            return;
        }
        inner.trial_in_flight = false;
        inner.metrics.abandoned_trials += 1;
        Self::transition(&mut inner, CircuitState::Open);
        warn!(
            component = %self.name,
            cooldown_ms = duration_ms(inner.cooldown),
            "⚠️ Circuit breaker trial abandoned, reopened"
        );
    }

    fn transition(inner: &mut BreakerState, to: CircuitState) {
        inner.state = to;
        inner.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        Self::transition(&mut inner, CircuitState::Open);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.cooldown = self.config.cooldown;
        inner.metrics.consecutive_failures = 0;
        Self::transition(&mut inner, CircuitState::Closed);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let mut snapshot = inner.metrics.clone();
        snapshot.current_state = inner.state;
        snapshot.current_cooldown = inner.cooldown;
        snapshot.finalize()
    }

    pub fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }
}
