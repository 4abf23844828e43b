//! # Message Marker Capabilities
//!
//! A message is any serde-capable value with a stable class identity. The
//! `QueueMessage` and `SubscribedMessage` markers declare which delivery modes
//! a type may travel through; the dispatcher checks the resolved marker before
//! handing a body to handlers.

use crate::messaging::headers::UserHeaders;
use crate::validation::{QueueName, TopicName};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base capability shared by every message type
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier persisted in the `MessageClass` header. Must never
    /// change once messages of this type have been written.
    fn class_identity() -> &'static str;
}

/// Marker for work items delivered once through a named queue
pub trait QueueMessage: Message {}

/// Marker for events fanned out to every active subscriber of a topic
pub trait SubscribedMessage: Message {}

/// Delivery mode a registered type supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Queue,
    Subscribed,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Subscribed => write!(f, "subscribed"),
        }
    }
}

/// Where an outgoing message is headed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Queue(QueueName),
    Topic(TopicName),
}

/// A message produced while handling another one. Written in the same unit of
/// work as the completion of the message that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub destination: Destination,
    pub message_class: &'static str,
    pub body: serde_json::Value,
    pub priority: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub user_headers: UserHeaders,
}

impl OutgoingMessage {
    /// Build an outgoing queue message
    pub fn queue<M: QueueMessage>(queue: QueueName, message: &M) -> serde_json::Result<Self> {
        Ok(Self {
            destination: Destination::Queue(queue),
            message_class: M::class_identity(),
            body: serde_json::to_value(message)?,
            priority: 0,
            not_before: None,
            user_headers: UserHeaders::default(),
        })
    }

    /// Build an outgoing published event
    pub fn publish<M: SubscribedMessage>(topic: TopicName, message: &M) -> serde_json::Result<Self> {
        Ok(Self {
            destination: Destination::Topic(topic),
            message_class: M::class_identity(),
            body: serde_json::to_value(message)?,
            priority: 0,
            not_before: None,
            user_headers: UserHeaders::default(),
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_headers.insert(name, value);
        self
    }
}
