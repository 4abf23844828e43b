//! # Message Headers
//!
//! Serialized alongside every body. `UserHeaders` keeps producer insertion order
//! through a round trip, which a plain `HashMap` would not.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Headers persisted with each message row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Headers {
    /// Class identity used to resolve the body's type
    pub message_class: String,

    /// Last failure detail, populated when processing fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_details: Option<String>,

    pub user_headers: UserHeaders,

    pub diagnostics: Diagnostics,
}

impl Headers {
    pub fn for_class(message_class: impl Into<String>) -> Self {
        Self {
            message_class: message_class.into(),
            ..Self::default()
        }
    }

    /// Copy with the failure detail replaced
    pub fn with_exception(&self, details: impl Into<String>) -> Self {
        Self {
            exception_details: Some(details.into()),
            ..self.clone()
        }
    }
}

/// Trace-correlation fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Diagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_parent: Option<String>,

    /// Start a new trace instead of continuing `trace_parent`
    pub new_trace: bool,
}

/// Ordered string-to-string mapping supplied by producers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserHeaders(Vec<(String, String)>);

impl UserHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. A replaced entry keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UserHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl Serialize for UserHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for UserHeaders {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = UserHeaders;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string header names to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut headers = UserHeaders::new();
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    headers.insert(name, value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}
