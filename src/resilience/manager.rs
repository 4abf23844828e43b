//! # Circuit Breaker Manager
//!
//! Lazily creates one breaker per protected resource, so the message store and
//! the saga store trip independently.

use crate::constants::breakers;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, SystemCircuitBreakerMetrics,
};
use dashmap::DashMap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Identifies one protected resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey(Cow<'static, str>);

impl BreakerKey {
    pub const MESSAGE_STORE: BreakerKey = BreakerKey(Cow::Borrowed(breakers::MESSAGE_STORE));
    pub const SAGA_STORE: BreakerKey = BreakerKey(Cow::Borrowed(breakers::SAGA_STORE));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Manager for the breakers of every protected resource
#[derive(Debug)]
pub struct CircuitBreakerManager {
    circuit_breakers: DashMap<BreakerKey, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    component_configs: HashMap<String, CircuitBreakerConfig>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            circuit_breakers: DashMap::new(),
            default_config,
            component_configs: HashMap::new(),
        }
    }

    /// Override the configuration for one resource. Takes effect for breakers
    /// created afterwards.
    pub fn with_component_config(mut self, key: &BreakerKey, config: CircuitBreakerConfig) -> Self {
        self.component_configs.insert(key.as_str().to_string(), config);
        self
    }

    pub fn config_for_component(&self, key: &BreakerKey) -> &CircuitBreakerConfig {
        self.component_configs
            .get(key.as_str())
            .unwrap_or(&self.default_config)
    }

    /// Get or create the breaker for a resource
    pub fn get_circuit_breaker(&self, key: &BreakerKey) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.get(key) {
            return Arc::clone(breaker.value());
        }

        let entry = self.circuit_breakers.entry(key.clone()).or_insert_with(|| {
            info!(component = %key, "Created new circuit breaker");
            Arc::new(CircuitBreaker::new(
                key.as_str(),
                self.config_for_component(key).clone(),
            ))
        });
        Arc::clone(entry.value())
    }

    pub fn list_components(&self) -> Vec<String> {
        self.circuit_breakers
            .iter()
            .map(|entry| entry.key().to_string())
            .collect()
    }

    pub fn get_component_metrics(&self, key: &BreakerKey) -> Option<CircuitBreakerMetrics> {
        self.circuit_breakers
            .get(key)
            .map(|breaker| breaker.metrics())
    }

    pub fn get_system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system_metrics = SystemCircuitBreakerMetrics::new();
        for entry in self.circuit_breakers.iter() {
            system_metrics.add_circuit_breaker(entry.key().to_string(), entry.value().metrics());
        }
        system_metrics
    }

    /// Force open all circuit breakers (emergency stop)
    pub fn force_open_all(&self) {
        warn!("🚨 Forcing all circuit breakers open (emergency stop)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_open();
        }
    }

    /// Force close all circuit breakers (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("🚨 Forcing all circuit breakers closed (emergency recovery)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_closed();
        }
    }
}
