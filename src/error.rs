//! # Error Taxonomy
//!
//! [`HandlerError`] is what a pipeline step, handler or saga returns while a
//! message is being processed; its [`ErrorCategory`] decides what the
//! orchestrator does next. [`BusError`] is the crate-level error for
//! assembly, producers and infrastructure failures.

use crate::config::ConfigurationError;
use crate::identity::RegistrationError;
use crate::messaging::MessageKind;
use crate::resilience::CircuitBreakerError;
use crate::saga::SagaMapError;
use crate::serialization::SerializationError;
use crate::store::StoreError;
use crate::validation::ValidationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// How the orchestrator treats a processing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Misconfiguration or undispatchable message, fails without retry
    Configuration,
    /// May succeed later, the retry policy decides
    Transient,
    /// Backing store unavailable, guarded by the circuit breaker
    Resource,
    /// Saga instance locked by another message, rescheduled as-is
    Deferred,
    /// Declared unrecoverable by the handler
    Permanent,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Transient => write!(f, "Transient"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Deferred => write!(f, "Deferred"),
            ErrorCategory::Permanent => write!(f, "Permanent"),
        }
    }
}

/// Failure raised while dispatching one message
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),

    #[error("message class '{class}' is not recognized")]
    ClassNotRecognized { class: String },

    #[error("message class '{class}' is not registered as a {expected} message")]
    KindMismatch { class: String, expected: MessageKind },

    #[error("no handler registered for {type_name}")]
    NoHandler { type_name: String },

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    SagaMap(#[from] SagaMapError),

    #[error("invalid saga key: {0}")]
    InvalidSagaKey(ValidationError),

    #[error("saga {saga} instance '{key}' is locked by another message")]
    SagaLocked { saga: String, key: String },

    #[error("saga {saga} instance '{key}' has not been started")]
    SagaNotStarted { saga: String, key: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("circuit breaker open for {component}, retry in {retry_after:?}")]
    CircuitOpen {
        component: String,
        retry_after: Duration,
    },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ClassNotRecognized { .. }
            | Self::KindMismatch { .. }
            | Self::NoHandler { .. }
            | Self::SagaMap(_)
            | Self::InvalidSagaKey(_) => ErrorCategory::Configuration,
            Self::SagaLocked { .. } => ErrorCategory::Deferred,
            Self::Permanent(_) => ErrorCategory::Permanent,
            Self::Store(e) if e.is_unavailable() => ErrorCategory::Resource,
            Self::CircuitOpen { .. } => ErrorCategory::Resource,
            Self::Transient(_)
            | Self::Other(_)
            | Self::Serialization(_)
            | Self::SagaNotStarted { .. }
            | Self::Store(_) => ErrorCategory::Transient,
        }
    }

    /// Whether the retry policy is consulted at all
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::Deferred | ErrorCategory::Resource
        )
    }

    /// Remaining breaker cooldown when the failure was an open circuit
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("circuit breaker open for {component}, retry in {retry_after:?}")]
    CircuitOpen {
        component: String,
        retry_after: Duration,
    },

    #[error("message type {type_name} is not registered")]
    UnregisteredType { type_name: String },

    #[error("worker {worker} terminated abnormally: {reason}")]
    WorkerFailed { worker: String, reason: String },
}

impl BusError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(e) if e.is_unavailable() => ErrorCategory::Resource,
            Self::CircuitOpen { .. } => ErrorCategory::Resource,
            Self::Store(_) | Self::WorkerFailed { .. } => ErrorCategory::Transient,
            _ => ErrorCategory::Configuration,
        }
    }
}

impl From<CircuitBreakerError<StoreError>> for BusError {
    fn from(error: CircuitBreakerError<StoreError>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen {
                component,
                retry_after,
            } => Self::CircuitOpen {
                component,
                retry_after,
            },
            CircuitBreakerError::OperationFailed(e) => Self::Store(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
