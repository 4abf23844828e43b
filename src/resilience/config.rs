//! # Circuit Breaker Configuration
//!
//! Runtime configuration for a single breaker. File-based settings live in
//! `crate::config` and convert into this type.

use crate::config::ConfigurationError;
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit open
    pub failure_threshold: u32,

    /// Initial time spent open before a trial call is admitted
    pub cooldown: Duration,

    /// Growth factor applied to the cooldown after a failed trial
    pub cooldown_multiplier: f64,

    /// Upper bound for the extended cooldown
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::for_database()
    }
}

impl CircuitBreakerConfig {
    /// Defaults for the message and saga stores
    pub fn for_database() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breakers.failure_threshold",
                self.failure_threshold.to_string(),
                "must be greater than 0",
            ));
        }

        if self.cooldown.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "circuit_breakers.cooldown_ms",
                "0",
                "must be greater than 0",
            ));
        }

        if !self.cooldown_multiplier.is_finite() || self.cooldown_multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breakers.cooldown_multiplier",
                self.cooldown_multiplier.to_string(),
                "must be a finite number >= 1.0",
            ));
        }

        if self.max_cooldown < self.cooldown {
            return Err(ConfigurationError::invalid_value(
                "circuit_breakers.max_cooldown_ms",
                self.max_cooldown.as_millis().to_string(),
                "must not be shorter than cooldown_ms",
            ));
        }

        Ok(())
    }

    /// Cooldown to use after a failed trial
    pub(crate) fn extend(&self, current: Duration) -> Duration {
        let extended = current.as_secs_f64() * self.cooldown_multiplier;
        if !extended.is_finite() || extended >= self.max_cooldown.as_secs_f64() {
            return self.max_cooldown;
        }
        Duration::try_from_secs_f64(extended).unwrap_or(self.max_cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = CircuitBreakerConfig::for_database();
        config.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = CircuitBreakerConfig::for_database();
        config.cooldown_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = CircuitBreakerConfig::for_database();
        config.max_cooldown = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extend_caps_at_max() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(10),
            cooldown_multiplier: 3.0,
            max_cooldown: Duration::from_secs(60),
        };
        assert_eq!(config.extend(Duration::from_secs(10)), Duration::from_secs(30));
        assert_eq!(config.extend(Duration::from_secs(30)), Duration::from_secs(60));
    }
}
