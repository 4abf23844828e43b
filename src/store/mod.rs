//! # Data Access Boundary
//!
//! Everything the orchestrator and producers need from the backing store,
//! expressed as two traits:
//!
//! - [`MessageStore`]: auto-committed operations (producer writes,
//!   subscriptions, saga lock acquisition and release) plus [`MessageStore::begin`].
//! - [`UnitOfWork`]: one transaction spanning claim, dispatch side effects and
//!   the terminal write. Dropping it without committing rolls back, leaving the
//!   claimed message pending.
//!
//! [`MemoryMessageStore`] and [`PgMessageStore`] implement both.

mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::StoreError;
pub use memory::MemoryMessageStore;
#[cfg(feature = "postgres")]
pub use postgres::PgMessageStore;

use crate::messaging::{ClaimedMessage, MessageKind, MessageState, NewMessage, QueueMessageRecord};
use crate::saga::{NewSagaRow, SagaKey, SagaRecord};
use crate::validation::{QueueName, SagaName, SubscriberName, TopicName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

/// The message table set a worker consumes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageTarget {
    Queue(QueueName),
    Subscriber {
        topic: TopicName,
        subscriber: SubscriberName,
    },
}

impl MessageTarget {
    pub fn queue(queue: QueueName) -> Self {
        Self::Queue(queue)
    }

    pub fn subscriber(topic: TopicName, subscriber: SubscriberName) -> Self {
        Self::Subscriber { topic, subscriber }
    }

    /// Marker capability a message must carry to be dispatched here
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Queue(_) => MessageKind::Queue,
            Self::Subscriber { .. } => MessageKind::Subscribed,
        }
    }
}

impl fmt::Display for MessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(queue) => write!(f, "queue:{queue}"),
            Self::Subscriber { topic, subscriber } => write!(f, "topic:{topic}/{subscriber}"),
        }
    }
}

/// Outcome of trying to take a saga instance's lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaLock {
    /// Lock taken. `created` is set when this call inserted the row.
    Acquired { record: SagaRecord, created: bool },
    /// Another message holds an unexpired lease
    Blocked,
    /// No row for the key and creation was not requested
    NotFound,
}

/// Auto-committed store operations
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Open a unit of work
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>>;

    /// Insert a pending queue row, returning its id
    async fn enqueue(&self, queue: &QueueName, message: NewMessage) -> StoreResult<i64>;

    /// Fan out one row per active subscriber, returning how many were written
    async fn publish(
        &self,
        topic: &TopicName,
        message: NewMessage,
        valid_until: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Activate a subscription (idempotent)
    async fn subscribe(&self, topic: &TopicName, subscriber: &SubscriberName) -> StoreResult<()>;

    /// Deactivate a subscription, returning whether it was active
    async fn unsubscribe(&self, topic: &TopicName, subscriber: &SubscriberName)
        -> StoreResult<bool>;

    async fn active_subscribers(&self, topic: &TopicName) -> StoreResult<Vec<SubscriberName>>;

    /// Take the lock for `(saga, key)`. A blocked row whose lease is older than
    /// `lease` is taken over. When `create` is given and no row exists, one is
    /// inserted already blocked.
    ///
    /// The returned row's `blocked_at` is the lock token: it strictly increases
    /// on every acquisition of a row, and the release, delete and save calls
    /// below only match while it is unchanged.
    async fn acquire_saga_lock(
        &self,
        saga: &SagaName,
        key: &SagaKey,
        lease: Duration,
        create: Option<NewSagaRow>,
    ) -> StoreResult<SagaLock>;

    /// Clear the lock without touching data. Does nothing when the lock was
    /// taken over since `locked_at`.
    async fn release_saga_lock(
        &self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Delete a row still locked at `locked_at`; does nothing otherwise
    async fn delete_saga(
        &self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn load_saga(&self, saga: &SagaName, key: &SagaKey) -> StoreResult<Option<SagaRecord>>;

    /// Look a message up by id in the pending, completed and failed tables
    async fn find_message(
        &self,
        target: &MessageTarget,
        message_id: Uuid,
    ) -> StoreResult<Option<QueueMessageRecord>>;

    async fn count_messages(&self, target: &MessageTarget, state: MessageState) -> StoreResult<u64>;
}

/// One store transaction
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock and return the next eligible row (priority DESC, id ASC), skipping
    /// rows locked by other units of work
    async fn claim_next(
        &mut self,
        target: &MessageTarget,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ClaimedMessage>>;

    /// Move a claimed row to the completed table
    async fn complete(
        &mut self,
        target: &MessageTarget,
        record_id: i64,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Move a claimed row to the failed table with the given headers
    async fn fail(
        &mut self,
        target: &MessageTarget,
        record_id: i64,
        failed_at: DateTime<Utc>,
        headers: String,
    ) -> StoreResult<()>;

    /// Keep a claimed row pending with a new schedule
    async fn reschedule(
        &mut self,
        target: &MessageTarget,
        record_id: i64,
        not_before: DateTime<Utc>,
        retries: i16,
        headers: Option<String>,
    ) -> StoreResult<()>;

    async fn enqueue(&mut self, queue: &QueueName, message: NewMessage) -> StoreResult<i64>;

    async fn publish(
        &mut self,
        topic: &TopicName,
        message: NewMessage,
        valid_until: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Persist saga data and clear its lock. Fails with
    /// [`StoreError::SagaLockLost`] when the lock is no longer held at
    /// `locked_at`.
    async fn save_saga(
        &mut self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
        data: String,
        metadata: String,
    ) -> StoreResult<()>;

    /// Delete a completed saga, failing like [`UnitOfWork::save_saga`] when
    /// the lock was lost
    async fn delete_saga(
        &mut self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
