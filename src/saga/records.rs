//! Saga keys and persisted saga rows.

use crate::constants::limits::MAX_SAGA_KEY_LENGTH;
use crate::validation::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation value identifying one saga instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SagaKey(String);

impl SagaKey {
    pub const MAX_LENGTH: usize = MAX_SAGA_KEY_LENGTH;

    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        let length = key.chars().count();
        if length == 0 {
            return Err(ValidationError::Empty { kind: "saga key" });
        }
        if length > Self::MAX_LENGTH {
            return Err(ValidationError::TooLong {
                kind: "saga key",
                actual: length,
                max: Self::MAX_LENGTH,
            });
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SagaKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SagaKey> for String {
    fn from(value: SagaKey) -> Self {
        value.0
    }
}

impl fmt::Display for SagaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Timestamps stored in the `metadata` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SagaMetadata {
    pub started: DateTime<Utc>,
    pub last_message_time: DateTime<Utc>,
}

impl SagaMetadata {
    pub fn started_at(now: DateTime<Utc>) -> Self {
        Self {
            started: now,
            last_message_time: now,
        }
    }
}

/// One persisted saga instance
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SagaRecord {
    pub id: i64,
    pub saga_id: Uuid,
    pub key: String,
    pub data: String,
    pub metadata: String,
    pub blocked: bool,
    /// When the current lock was taken; `None` when unlocked
    pub blocked_at: Option<DateTime<Utc>>,
}

/// Values for a saga row created by a starting message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSagaRow {
    pub saga_id: Uuid,
    pub data: String,
    pub metadata: String,
}
