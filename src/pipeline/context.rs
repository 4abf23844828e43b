//! Per-message processing context.

use crate::identity::{MessageBody, TypeEntry};
use crate::messaging::{Headers, Message, OutgoingMessage};
use crate::store::MessageTarget;
use crate::validation::SagaName;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A saga row locked while dispatching this message
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeldSagaLock {
    pub saga: SagaName,
    pub record_id: i64,
    /// Lock token returned by the store
    pub locked_at: DateTime<Utc>,
    /// The row was inserted by this attempt
    pub created: bool,
}

/// Saga persistence applied in the message's unit of work on success
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SagaWrite {
    Save {
        saga: SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
        data: String,
        metadata: String,
    },
    Delete {
        saga: SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    },
}

impl SagaWrite {
    /// Whether committing this write clears `lock`
    pub(crate) fn clears(&self, lock: &HeldSagaLock) -> bool {
        match self {
            Self::Save {
                saga, record_id, ..
            }
            | Self::Delete {
                saga, record_id, ..
            } => *saga == lock.saga && *record_id == lock.record_id,
        }
    }
}

/// Everything known about the message being processed, shared by every
/// pipeline step and handler of one dispatch
pub struct MessageContext {
    pub message_id: Uuid,
    pub record_id: i64,
    pub target: MessageTarget,
    pub headers: Headers,
    /// Failed attempts before this one
    pub retries: i16,
    pub enqueued: DateTime<Utc>,
    message_type: Arc<TypeEntry>,
    body: MessageBody,
    items: HashMap<String, serde_json::Value>,
    outgoing: Vec<OutgoingMessage>,
    saga_locks: Vec<HeldSagaLock>,
    saga_writes: Vec<SagaWrite>,
}

impl MessageContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_id: Uuid,
        record_id: i64,
        target: MessageTarget,
        headers: Headers,
        retries: i16,
        enqueued: DateTime<Utc>,
        message_type: Arc<TypeEntry>,
        body: MessageBody,
    ) -> Self {
        Self {
            message_id,
            record_id,
            target,
            headers,
            retries,
            enqueued,
            message_type,
            body,
            items: HashMap::new(),
            outgoing: Vec::new(),
            saga_locks: Vec::new(),
            saga_writes: Vec::new(),
        }
    }

    pub fn message_type(&self) -> &Arc<TypeEntry> {
        &self.message_type
    }

    /// The decoded body, if it is an `M`
    pub fn body<M: Message>(&self) -> Option<&M> {
        self.body.downcast_ref::<M>()
    }

    /// Shared handle on the decoded body
    pub fn body_handle(&self) -> MessageBody {
        Arc::clone(&self.body)
    }

    /// Attach a value for later steps or handlers
    pub fn set_item(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.items.insert(key.into(), value);
    }

    pub fn item(&self, key: &str) -> Option<&serde_json::Value> {
        self.items.get(key)
    }

    /// Queue a message to be written when this one completes
    pub fn send(&mut self, message: OutgoingMessage) {
        self.outgoing.push(message);
    }

    pub fn outgoing(&self) -> &[OutgoingMessage] {
        &self.outgoing
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.outgoing)
    }

    pub(crate) fn hold_saga_lock(&mut self, lock: HeldSagaLock) {
        self.saga_locks.push(lock);
    }

    pub(crate) fn take_saga_locks(&mut self) -> Vec<HeldSagaLock> {
        std::mem::take(&mut self.saga_locks)
    }

    pub(crate) fn record_saga_write(&mut self, write: SagaWrite) {
        self.saga_writes.push(write);
    }

    pub(crate) fn take_saga_writes(&mut self) -> Vec<SagaWrite> {
        std::mem::take(&mut self.saga_writes)
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("message_id", &self.message_id)
            .field("record_id", &self.record_id)
            .field("target", &self.target)
            .field("message_class", &self.headers.message_class)
            .field("retries", &self.retries)
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}
