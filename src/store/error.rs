use crate::validation::ValidationError;
use thiserror::Error;

/// Failures surfaced by a store adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store cannot be reached; trips the circuit breaker
    #[error("store unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },

    #[error("store query failed during {operation}: {message}")]
    Query { operation: String, message: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The saga lease expired and another message took the row over
    #[error("lock on saga {saga} row {id} was lost to another message")]
    SagaLockLost { saga: String, id: i64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl StoreError {
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn saga_lock_lost(saga: impl ToString, id: i64) -> Self {
        Self::SagaLockLost {
            saga: saga.to_string(),
            id,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Map a driver error, tagging it with the operation that raised it
    pub fn from_sqlx(operation: &str, error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => Self::unavailable(operation, error.to_string()),
            // SQLSTATE class 08 is connection exception, 57P01 is admin shutdown
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| code.starts_with("08") || code == "57P01") =>
            {
                Self::unavailable(operation, error.to_string())
            }
            sqlx::Error::RowNotFound => Self::not_found("row", operation),
            _ => Self::query(operation, error.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::from_sqlx("database", error)
    }
}
