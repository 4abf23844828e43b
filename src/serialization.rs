//! # Serialization Contracts
//!
//! Bodies, headers and saga data are persisted as text. A [`Serializer`] turns
//! `serde_json::Value`s into text and back; [`SerializerExt`] layers the typed
//! helpers on top so a serializer stays object-safe behind `Arc<dyn Serializer>`.
//!
//! Failures carry the operation, target type and raw payload. Nothing is
//! coerced into a default silently, with one exception: empty header text
//! decodes to `Headers::default()`, since rows written without headers are
//! legitimate.

use crate::identity::{MessageBody, TypeEntry};
use crate::messaging::Headers;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Which direction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationOperation {
    Serialize,
    Deserialize,
}

impl fmt::Display for SerializationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize => write!(f, "serialize"),
            Self::Deserialize => write!(f, "deserialize"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to {operation} {target_type}: {message}")]
pub struct SerializationError {
    pub operation: SerializationOperation,
    pub target_type: String,
    /// Raw text involved, empty when serializing
    pub payload: String,
    pub message: String,
}

impl SerializationError {
    pub fn serialize(target_type: impl Into<String>, source: impl fmt::Display) -> Self {
        Self {
            operation: SerializationOperation::Serialize,
            target_type: target_type.into(),
            payload: String::new(),
            message: source.to_string(),
        }
    }

    pub fn deserialize(
        target_type: impl Into<String>,
        payload: impl Into<String>,
        source: impl fmt::Display,
    ) -> Self {
        Self {
            operation: SerializationOperation::Deserialize,
            target_type: target_type.into(),
            payload: payload.into(),
            message: source.to_string(),
        }
    }
}

/// Object-safe text codec
pub trait Serializer: Send + Sync {
    /// Short format name used in logs
    fn format(&self) -> &'static str;

    fn encode(&self, value: &serde_json::Value) -> Result<String, serde_json::Error>;

    fn decode(&self, text: &str) -> Result<serde_json::Value, serde_json::Error>;
}

/// Typed helpers available on every serializer
pub trait SerializerExt: Serializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, SerializationError> {
        let type_name = std::any::type_name::<T>();
        let value = serde_json::to_value(value)
            .map_err(|e| SerializationError::serialize(type_name, e))?;
        self.encode(&value)
            .map_err(|e| SerializationError::serialize(type_name, e))
    }

    fn deserialize<T: DeserializeOwned>(&self, text: &str) -> Result<T, SerializationError> {
        let type_name = std::any::type_name::<T>();
        let value = self
            .decode(text)
            .map_err(|e| SerializationError::deserialize(type_name, text, e))?;
        serde_json::from_value(value)
            .map_err(|e| SerializationError::deserialize(type_name, text, e))
    }

    /// Decode a body into the concrete type of a resolved entry
    fn deserialize_entry(
        &self,
        text: &str,
        entry: &TypeEntry,
    ) -> Result<MessageBody, SerializationError> {
        let value = self
            .decode(text)
            .map_err(|e| SerializationError::deserialize(entry.type_name(), text, e))?;
        entry
            .decode(value)
            .map_err(|e| SerializationError::deserialize(entry.type_name(), text, e))
    }

    fn serialize_headers(&self, headers: &Headers) -> Result<String, SerializationError> {
        self.serialize(headers)
    }

    fn deserialize_headers(&self, text: &str) -> Result<Headers, SerializationError> {
        if text.trim().is_empty() {
            return Ok(Headers::default());
        }
        self.deserialize(text)
    }
}

impl<S: Serializer + ?Sized> SerializerExt for S {}

/// Compact JSON text
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn format(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &serde_json::Value) -> Result<String, serde_json::Error> {
        serde_json::to_string(value)
    }

    fn decode(&self, text: &str) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(text)
    }
}
