//! # Retry Policy
//!
//! Decides, for a failed message, whether to try again and after what delay.
//! Strategies are pure: same input, same verdict, never a panic, never a
//! negative delay.

use crate::error::{ErrorCategory, HandlerError};
use crate::store::MessageTarget;
use crate::validation::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// 1-based attempt number of the failure being evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FailureCount(u32);

impl FailureCount {
    pub fn new(count: i64) -> Result<Self, ValidationError> {
        if count < 1 {
            return Err(ValidationError::InvalidFailureCount(count));
        }
        u32::try_from(count)
            .map(Self)
            .map_err(|_| ValidationError::InvalidFailureCount(count))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FailureCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Verdict returned by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryResult {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryResult {
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay,
        }
    }

    pub fn give_up() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// What a strategy may inspect besides the error itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    pub target: MessageTarget,
    pub message_id: Uuid,
    pub message_class: String,
    /// Failed attempts recorded before this one
    pub previous_retries: i16,
}

pub trait RetryStrategy: Send + Sync {
    fn determine_retry(
        &self,
        context: &RetryContext,
        error: &HandlerError,
        failure_count: FailureCount,
    ) -> RetryResult;
}

/// Capped exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_retries: u32,
}

impl Default for ExponentialBackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5 minutes
            multiplier: 2.0,
            max_retries: 10,
        }
    }
}

/// Default strategy: `delay(n) = min(base * multiplier^(n-1), max)`, retrying
/// while `n <= max_retries`
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoffStrategy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_retries: u32,
}

impl ExponentialBackoffStrategy {
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            max_retries,
        }
    }

    pub fn from_config(config: &ExponentialBackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
            config.max_retries,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff for the given attempt, clamped to the configured maximum
    pub fn delay(&self, failure_count: FailureCount) -> Duration {
        let exponent = i32::try_from(failure_count.get() - 1).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(self.max_delay)
    }
}

impl Default for ExponentialBackoffStrategy {
    fn default() -> Self {
        Self::from_config(&ExponentialBackoffConfig::default())
    }
}

impl RetryStrategy for ExponentialBackoffStrategy {
    fn determine_retry(
        &self,
        _context: &RetryContext,
        _error: &HandlerError,
        failure_count: FailureCount,
    ) -> RetryResult {
        if failure_count.get() > self.max_retries {
            return RetryResult::give_up();
        }
        RetryResult::retry_after(self.delay(failure_count))
    }
}

/// Refuses to retry handler-declared permanent failures, otherwise defers to
/// the wrapped strategy
#[derive(Debug, Clone)]
pub struct FailFastStrategy<S> {
    inner: S,
}

impl<S: RetryStrategy> FailFastStrategy<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: RetryStrategy> RetryStrategy for FailFastStrategy<S> {
    fn determine_retry(
        &self,
        context: &RetryContext,
        error: &HandlerError,
        failure_count: FailureCount,
    ) -> RetryResult {
        if error.category() == ErrorCategory::Permanent {
            return RetryResult::give_up();
        }
        self.inner.determine_retry(context, error, failure_count)
    }
}

/// Closure-backed strategy
pub struct FnRetryStrategy<F>(F);

impl<F> FnRetryStrategy<F>
where
    F: Fn(&RetryContext, &HandlerError, FailureCount) -> RetryResult + Send + Sync,
{
    pub fn new(decide: F) -> Self {
        Self(decide)
    }
}

impl<F> RetryStrategy for FnRetryStrategy<F>
where
    F: Fn(&RetryContext, &HandlerError, FailureCount) -> RetryResult + Send + Sync,
{
    fn determine_retry(
        &self,
        context: &RetryContext,
        error: &HandlerError,
        failure_count: FailureCount,
    ) -> RetryResult {
        (self.0)(context, error, failure_count)
    }
}
