//! # Producer API
//!
//! Auto-committed writes of new messages. Each send serializes the body,
//! stamps `MessageClass` from the class-identity resolver and goes through the
//! message store breaker.

use super::processor::after;
use crate::constants::headers::CONVERSATION_ID;
use crate::error::{BusError, Result};
use crate::identity::ClassResolver;
use crate::logging::log_message_operation;
use crate::messaging::{Headers, Message, NewMessage, QueueMessage, SubscribedMessage, UserHeaders};
use crate::resilience::CircuitBreaker;
use crate::serialization::{Serializer, SerializerExt};
use crate::store::{MessageStore, StoreError, StoreResult};
use crate::validation::{MessageId, QueueName, SubscriberName, TopicName};
use chrono::{DateTime, Utc};
use std::any::{type_name, TypeId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Per-send options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    /// Earliest processing time, `now` when unset
    pub not_before: Option<DateTime<Utc>>,
    /// Higher values are claimed first
    pub priority: i32,
    pub user_headers: UserHeaders,
    /// Start a fresh conversation and trace instead of continuing one
    pub new_conversation: bool,
    pub trace_parent: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
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

    pub fn new_conversation(mut self) -> Self {
        self.new_conversation = true;
        self
    }

    pub fn with_trace_parent(mut self, trace_parent: impl Into<String>) -> Self {
        self.trace_parent = Some(trace_parent.into());
        self
    }
}

/// Publishing takes the same options as enqueueing
pub type PublishOptions = EnqueueOptions;

/// Cheap to clone; every clone shares the store, resolver and breaker
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn MessageStore>,
    resolver: Arc<dyn ClassResolver>,
    serializer: Arc<dyn Serializer>,
    breaker: Arc<CircuitBreaker>,
    retention: Duration,
}

impl Producer {
    pub(crate) fn new(
        store: Arc<dyn MessageStore>,
        resolver: Arc<dyn ClassResolver>,
        serializer: Arc<dyn Serializer>,
        breaker: Arc<CircuitBreaker>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            serializer,
            breaker,
            retention,
        }
    }

    /// Insert one pending row into `queue`
    #[instrument(skip(self, message, options), fields(queue = %queue))]
    pub async fn enqueue<M: QueueMessage>(
        &self,
        queue: &QueueName,
        message: &M,
        options: EnqueueOptions,
    ) -> Result<MessageId> {
        queue.value()?;
        let message_id = MessageId::generate();
        let row = self.new_row(message, message_id, options, Utc::now())?;
        let record_id = self.guarded(self.store.enqueue(queue, row)).await?;

        debug!(message_id = %message_id, record_id, "📤 Message enqueued");
        log_message_operation(
            "enqueue",
            &format!("queue:{queue}"),
            Some(message_id.as_uuid()),
            Some(M::class_identity()),
            "pending",
            None,
        );
        Ok(message_id)
    }

    /// Fan `message` out to every active subscriber of `topic`, returning how
    /// many subscribers were targeted
    #[instrument(skip(self, message, options), fields(topic = %topic))]
    pub async fn publish<M: SubscribedMessage>(
        &self,
        topic: &TopicName,
        message: &M,
        options: PublishOptions,
    ) -> Result<u64> {
        topic.value()?;
        let now = Utc::now();
        let message_id = MessageId::generate();
        let row = self.new_row(message, message_id, options, now)?;
        let valid_until = after(now, self.retention);
        let targeted = self
            .guarded(self.store.publish(topic, row, valid_until))
            .await?;

        debug!(message_id = %message_id, targeted, "📣 Message published");
        Ok(targeted)
    }

    /// Activate `subscriber` on `topic`; idempotent
    pub async fn subscribe(&self, topic: &TopicName, subscriber: &SubscriberName) -> Result<()> {
        topic.value()?;
        subscriber.value()?;
        self.guarded(self.store.subscribe(topic, subscriber)).await?;
        info!(topic = %topic, subscriber = %subscriber, "Subscription active");
        Ok(())
    }

    /// Deactivate `subscriber` on `topic`, returning whether it was active
    pub async fn unsubscribe(
        &self,
        topic: &TopicName,
        subscriber: &SubscriberName,
    ) -> Result<bool> {
        topic.value()?;
        subscriber.value()?;
        let was_active = self
            .guarded(self.store.unsubscribe(topic, subscriber))
            .await?;
        info!(topic = %topic, subscriber = %subscriber, was_active, "Subscription deactivated");
        Ok(was_active)
    }

    fn new_row<M: Message>(
        &self,
        message: &M,
        message_id: MessageId,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<NewMessage> {
        let identity = self
            .resolver
            .identity_for(TypeId::of::<M>())
            .ok_or_else(|| BusError::UnregisteredType {
                type_name: type_name::<M>().to_string(),
            })?;

        let mut headers = Headers::for_class(identity.as_str());
        headers.user_headers = options.user_headers;
        headers.diagnostics.trace_parent = options.trace_parent;
        if options.new_conversation {
            headers.diagnostics.new_trace = true;
            headers
                .user_headers
                .insert(CONVERSATION_ID, Uuid::new_v4().to_string());
        }

        Ok(NewMessage {
            message_id: message_id.as_uuid(),
            priority: options.priority,
            not_before: options.not_before.unwrap_or(now),
            enqueued: now,
            headers: self.serializer.serialize_headers(&headers)?,
            body: self.serializer.serialize(message)?,
        })
    }

    async fn guarded<T, Fut>(&self, action: Fut) -> Result<T>
    where
        Fut: Future<Output = StoreResult<T>>,
    {
        self.breaker
            .call_classified(|| action, StoreError::is_unavailable)
            .await
            .map_err(BusError::from)
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("breaker", &self.breaker.name())
            .field("retention", &self.retention)
            .finish()
    }
}
