//! # Validated Names and Identifiers
//!
//! Queue, topic, subscriber and saga names end up inside SQL identifiers, so
//! they are validated once at construction and carried around as typed values.
//! A default-constructed name is *uninitialized*: reading it is an error rather
//! than an empty string.

use crate::constants::limits::MAX_NAME_LENGTH;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while constructing or reading validated values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} must not be empty or whitespace")]
    Empty { kind: &'static str },

    #[error("{kind} '{value}' contains characters outside [a-z0-9_.]")]
    InvalidCharacters { kind: &'static str, value: String },

    #[error("{kind} is {actual} characters long, maximum is {max}")]
    TooLong {
        kind: &'static str,
        actual: usize,
        max: usize,
    },

    #[error("{kind} is not initialized")]
    NotInitialized { kind: &'static str },

    #[error("{kind} must not be the nil identifier")]
    NilIdentifier { kind: &'static str },

    #[error("failure count must be at least 1, got {0}")]
    InvalidFailureCount(i64),
}

fn validate_name(kind: &'static str, raw: &str) -> Result<(), ValidationError> {
    if raw.trim().is_empty() {
        return Err(ValidationError::Empty { kind });
    }

    let length = raw.chars().count();
    if length > MAX_NAME_LENGTH {
        return Err(ValidationError::TooLong {
            kind,
            actual: length,
            max: MAX_NAME_LENGTH,
        });
    }

    let valid = raw
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.');
    if !valid {
        return Err(ValidationError::InvalidCharacters {
            kind,
            value: raw.to_string(),
        });
    }

    Ok(())
}

macro_rules! validated_name {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Option<String>);

        impl $name {
            /// Validate and wrap a raw name
            pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
                let raw = raw.into();
                validate_name($kind, &raw)?;
                Ok(Self(Some(raw)))
            }

            /// The validated name, or `NotInitialized` for a default value
            pub fn value(&self) -> Result<&str, ValidationError> {
                self.0
                    .as_deref()
                    .ok_or(ValidationError::NotInitialized { kind: $kind })
            }

            pub fn is_initialized(&self) -> bool {
                self.0.is_some()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &self.0 {
                    Some(name) => f.write_str(name),
                    None => write!(f, "<uninitialized {}>", $kind),
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

validated_name!(
    /// Name of a durable work queue
    QueueName,
    "queue name"
);
validated_name!(
    /// Name of a publish/subscribe topic
    TopicName,
    "topic name"
);
validated_name!(
    /// Identity of a subscriber receiving its own copy of published messages
    SubscriberName,
    "subscriber name"
);
validated_name!(
    /// Table prefix for one saga type's persisted instances
    SagaName,
    "saga name"
);

/// Globally unique message identifier; the nil UUID is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new(id: Uuid) -> Result<Self, ValidationError> {
        if id.is_nil() {
            return Err(ValidationError::NilIdentifier { kind: "message id" });
        }
        Ok(Self(id))
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl TryFrom<Uuid> for MessageId {
    type Error = ValidationError;

    fn try_from(value: Uuid) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MessageId> for Uuid {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
