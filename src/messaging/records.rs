//! # Persisted Message Rows
//!
//! Row shapes shared by every store adapter, plus the lifecycle state derived
//! from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Waiting for `not_before`, or eligible and not yet claimed
    Pending,
    /// Handled successfully
    Completed,
    /// Terminal failure: exhausted retries or not dispatchable
    Failed,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid message state: {s}")),
        }
    }
}

/// One enqueued work item
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueMessageRecord {
    pub id: i64,
    pub message_id: Uuid,
    pub priority: i32,
    pub not_before: DateTime<Utc>,
    pub enqueued: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub failed: Option<DateTime<Utc>>,
    pub retries: i16,
    pub headers: String,
    pub body: String,
}

impl QueueMessageRecord {
    pub fn state(&self) -> MessageState {
        match (self.completed, self.failed) {
            (Some(_), _) => MessageState::Completed,
            (None, Some(_)) => MessageState::Failed,
            (None, None) => MessageState::Pending,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state() == MessageState::Pending && self.not_before <= now
    }
}

/// One subscriber's copy of a published event
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SubscribedMessageRecord {
    #[sqlx(flatten)]
    pub message: QueueMessageRecord,
    pub subscriber_id: String,
    /// After this instant the row is never claimed and may be purged
    pub valid_until: DateTime<Utc>,
}

impl SubscribedMessageRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.message.is_eligible(now) && !self.is_expired(now)
    }
}

/// Row produced by a producer before the store assigns an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub message_id: Uuid,
    pub priority: i32,
    pub not_before: DateTime<Utc>,
    pub enqueued: DateTime<Utc>,
    pub headers: String,
    pub body: String,
}

impl NewMessage {
    pub(crate) fn into_record(self, id: i64) -> QueueMessageRecord {
        QueueMessageRecord {
            id,
            message_id: self.message_id,
            priority: self.priority,
            not_before: self.not_before,
            enqueued: self.enqueued,
            completed: None,
            failed: None,
            retries: 0,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// A row claimed by a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimedMessage {
    Queue(QueueMessageRecord),
    Subscribed(SubscribedMessageRecord),
}

impl ClaimedMessage {
    pub fn record(&self) -> &QueueMessageRecord {
        match self {
            Self::Queue(record) => record,
            Self::Subscribed(subscribed) => &subscribed.message,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Queue(record) => record.is_eligible(now),
            Self::Subscribed(subscribed) => subscribed.is_eligible(now),
        }
    }

    pub(crate) fn record_mut(&mut self) -> &mut QueueMessageRecord {
        match self {
            Self::Queue(record) => record,
            Self::Subscribed(subscribed) => &mut subscribed.message,
        }
    }
}
