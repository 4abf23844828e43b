//! # Resilience Module
//!
//! Circuit breakers guarding the backing store. When the store becomes
//! unavailable, workers stop hammering it and retry at reduced frequency
//! instead of failing every message individually.
//!
//! ## Usage
//!
//! ```rust
//! use workbus::resilience::{BreakerKey, CircuitBreakerManager};
//!
//! # tokio_test::block_on(async {
//! let manager = CircuitBreakerManager::default();
//! let breaker = manager.get_circuit_breaker(&BreakerKey::MESSAGE_STORE);
//!
//! let result = breaker
//!     .call(|| async { Ok::<_, std::io::Error>("claimed") })
//!     .await;
//! assert!(result.is_ok());
//! # });
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use manager::{BreakerKey, CircuitBreakerManager};
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
