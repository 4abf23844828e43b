//! Message types, handlers, a saga and bus helpers shared by the integration
//! tests. Everything runs against `MemoryMessageStore`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use workbus::config::BusConfig;
use workbus::messaging::{
    Headers, Message, MessageState, NewMessage, OutgoingMessage, QueueMessage, QueueMessageRecord,
    SubscribedMessage,
};
use workbus::orchestration::{FailedMessage, FailedMessageHandler};
use workbus::pipeline::MessageContext;
use workbus::registry::Handler;
use workbus::saga::{Saga, SagaHandler, SagaKeyMapper, SagaState, SagaTransition};
use workbus::serialization::{JsonSerializer, SerializerExt};
use workbus::store::{MemoryMessageStore, MessageStore, MessageTarget};
use workbus::validation::{QueueName, SubscriberName, TopicName};
use workbus::HandlerError;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub amount: u32,
}

impl Message for OrderPlaced {
    fn class_identity() -> &'static str {
        "orders.placed"
    }
}
impl QueueMessage for OrderPlaced {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceived {
    pub order_id: String,
    pub amount: u32,
}

impl Message for PaymentReceived {
    fn class_identity() -> &'static str {
        "payments.received"
    }
}
impl QueueMessage for PaymentReceived {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRequested {
    pub order_id: String,
}

impl Message for InvoiceRequested {
    fn class_identity() -> &'static str {
        "billing.invoice_requested"
    }
}
impl QueueMessage for InvoiceRequested {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: String,
}

impl Message for OrderShipped {
    fn class_identity() -> &'static str {
        "orders.shipped"
    }
}
impl SubscribedMessage for OrderShipped {}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

pub fn orders_queue() -> QueueName {
    QueueName::new("orders").unwrap()
}

pub fn invoices_queue() -> QueueName {
    QueueName::new("invoices").unwrap()
}

pub fn shipping_topic() -> TopicName {
    TopicName::new("shipping").unwrap()
}

pub fn notifier() -> SubscriberName {
    SubscriberName::new("notifier").unwrap()
}

pub fn orders_target() -> MessageTarget {
    MessageTarget::queue(orders_queue())
}

pub fn order(order_id: &str, amount: u32) -> OrderPlaced {
    OrderPlaced {
        order_id: order_id.to_string(),
        amount,
    }
}

pub fn payment(order_id: &str, amount: u32) -> PaymentReceived {
    PaymentReceived {
        order_id: order_id.to_string(),
        amount,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Records the order ids it sees, in order
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Handler<OrderPlaced> for RecordingHandler {
    async fn handle(&self, message: &OrderPlaced, _ctx: &mut MessageContext) -> Result<(), HandlerError> {
        self.seen.lock().push(message.order_id.clone());
        Ok(())
    }
}

#[async_trait]
impl Handler<OrderShipped> for RecordingHandler {
    async fn handle(&self, message: &OrderShipped, _ctx: &mut MessageContext) -> Result<(), HandlerError> {
        self.seen.lock().push(message.order_id.clone());
        Ok(())
    }
}

/// Fails transiently the first `failures` times, then succeeds
#[derive(Clone)]
pub struct FlakyHandler {
    remaining: Arc<AtomicU32>,
    pub attempts: Arc<AtomicU32>,
}

impl FlakyHandler {
    pub fn failing(failures: u32) -> Self {
        Self {
            remaining: Arc::new(AtomicU32::new(failures)),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler<OrderPlaced> for FlakyHandler {
    async fn handle(&self, message: &OrderPlaced, _ctx: &mut MessageContext) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(HandlerError::transient(format!(
                "inventory service unreachable for {}",
                message.order_id
            )));
        }
        Ok(())
    }
}

/// Declares every order unprocessable
pub struct RejectingHandler;

#[async_trait]
impl Handler<OrderPlaced> for RejectingHandler {
    async fn handle(&self, message: &OrderPlaced, _ctx: &mut MessageContext) -> Result<(), HandlerError> {
        Err(HandlerError::permanent(format!(
            "order {} references a deleted customer",
            message.order_id
        )))
    }
}

/// Sends an `InvoiceRequested`, optionally failing afterwards
pub struct InvoicingHandler {
    pub fail_after_send: bool,
}

#[async_trait]
impl Handler<OrderPlaced> for InvoicingHandler {
    async fn handle(&self, message: &OrderPlaced, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        let outgoing = OutgoingMessage::queue(
            invoices_queue(),
            &InvoiceRequested {
                order_id: message.order_id.clone(),
            },
        )
        .map_err(anyhow::Error::from)?
        .with_header("origin", "invoicing");
        ctx.send(outgoing);

        if self.fail_after_send {
            return Err(HandlerError::transient("ledger write failed"));
        }
        Ok(())
    }
}

/// Collects every failure notification
#[derive(Clone, Default)]
pub struct CollectingFailedHandler {
    pub failures: Arc<Mutex<Vec<FailedMessage>>>,
}

impl CollectingFailedHandler {
    pub fn failures(&self) -> Vec<FailedMessage> {
        self.failures.lock().clone()
    }
}

#[async_trait]
impl FailedMessageHandler for CollectingFailedHandler {
    async fn on_failed(&self, failure: &FailedMessage) {
        self.failures.lock().push(failure.clone());
    }
}

// ---------------------------------------------------------------------------
// Saga
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FulfilmentData {
    pub amount_due: u32,
    pub amount_paid: u32,
    pub events: Vec<String>,
}

/// Starts on `OrderPlaced`, completes once payments cover the amount due.
/// A zero-amount order or payment is rejected with a transient error.
#[derive(Clone, Default)]
pub struct FulfilmentSaga {
    pub configure_calls: Arc<AtomicUsize>,
}

impl FulfilmentSaga {
    pub fn configure_calls(&self) -> usize {
        self.configure_calls.load(Ordering::SeqCst)
    }
}

impl Saga for FulfilmentSaga {
    type Data = FulfilmentData;

    fn saga_name() -> &'static str {
        "fulfilment"
    }

    fn configure_message_keys(&self, mapper: &mut SagaKeyMapper) {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        mapper
            .map::<OrderPlaced, _>(|m| m.order_id.clone())
            .map::<PaymentReceived, _>(|m| m.order_id.clone());
    }
}

#[async_trait]
impl SagaHandler<OrderPlaced> for FulfilmentSaga {
    async fn handle(
        &self,
        message: &OrderPlaced,
        mut state: SagaState<FulfilmentData>,
        _ctx: &MessageContext,
    ) -> Result<SagaTransition<FulfilmentData>, HandlerError> {
        if message.amount == 0 {
            return Err(HandlerError::transient("order amount missing"));
        }
        state.data.amount_due = message.amount;
        state.data.events.push(format!("placed:{}", message.amount));
        Ok(SagaTransition::new(state))
    }
}

#[async_trait]
impl SagaHandler<PaymentReceived> for FulfilmentSaga {
    async fn handle(
        &self,
        message: &PaymentReceived,
        mut state: SagaState<FulfilmentData>,
        _ctx: &MessageContext,
    ) -> Result<SagaTransition<FulfilmentData>, HandlerError> {
        if message.amount == 0 {
            return Err(HandlerError::transient("payment amount missing"));
        }
        state.data.amount_paid += message.amount;
        state.data.events.push(format!("paid:{}", message.amount));

        if state.data.amount_paid < state.data.amount_due {
            return Ok(SagaTransition::new(state));
        }

        let order_id = state.key.as_str().to_string();
        state.mark_complete();
        let outgoing = OutgoingMessage::queue(invoices_queue(), &InvoiceRequested { order_id })
            .map_err(anyhow::Error::from)?;
        Ok(SagaTransition::new(state).send(outgoing))
    }
}

// ---------------------------------------------------------------------------
// Bus and store helpers
// ---------------------------------------------------------------------------

/// Configuration with millisecond delays so tests never sleep long
pub fn fast_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.polling.idle_delay_ms = 5;
    config.polling.error_delay_ms = 5;
    config.polling.max_error_delay_ms = 20;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 1_000;
    config.retry.max_retries = 3;
    config.saga.lock_retry_delay_ms = 1;
    config
}

pub fn memory_store() -> Arc<MemoryMessageStore> {
    Arc::new(MemoryMessageStore::new())
}

/// Insert a row directly, bypassing the producer's type checks
pub async fn enqueue_raw(
    store: &MemoryMessageStore,
    queue: &QueueName,
    message_class: &str,
    body: serde_json::Value,
) -> uuid::Uuid {
    let message_id = uuid::Uuid::new_v4();
    let now = chrono::Utc::now();
    store
        .enqueue(
            queue,
            NewMessage {
                message_id,
                priority: 0,
                not_before: now,
                enqueued: now,
                headers: JsonSerializer
                    .serialize_headers(&Headers::for_class(message_class))
                    .unwrap(),
                body: body.to_string(),
            },
        )
        .await
        .unwrap();
    message_id
}

pub fn single_row(
    store: &MemoryMessageStore,
    target: &MessageTarget,
    state: MessageState,
) -> QueueMessageRecord {
    let rows = store.rows(target, state);
    assert_eq!(rows.len(), 1, "expected exactly one {state} row in {target}");
    rows[0].record().clone()
}

pub fn headers_of(record: &QueueMessageRecord) -> Headers {
    JsonSerializer.deserialize_headers(&record.headers).unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
