//! Saga correlation, locking and persistence through the message processor.

mod common;

use async_trait::async_trait;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use workbus::messaging::MessageState;
use workbus::orchestration::{EnqueueOptions, MessageBus, ProcessOutcome};
use workbus::pipeline::{MessageContext, Next, PipelineStep};
use workbus::resilience::BreakerKey;
use workbus::saga::{NewSagaRow, SagaKey};
use workbus::store::{MemoryMessageStore, MessageStore, SagaLock, StoreError};
use workbus::validation::SagaName;
use workbus::{BusConfig, BusError, ErrorCategory, HandlerError};

fn fulfilment() -> SagaName {
    SagaName::new("fulfilment").unwrap()
}

fn key(value: &str) -> SagaKey {
    SagaKey::new(value).unwrap()
}

fn saga_bus(store: Arc<MemoryMessageStore>, saga: FulfilmentSaga, config: BusConfig) -> MessageBus {
    MessageBus::builder(store)
        .with_config(config)
        .saga(saga, |registrar| {
            registrar
                .starts_with::<OrderPlaced>()
                .handles::<PaymentReceived>();
        })
        .queue(orders_queue())
        .build()
        .unwrap()
}

fn saga_bus_with_step(
    store: Arc<MemoryMessageStore>,
    step: impl PipelineStep + 'static,
) -> MessageBus {
    MessageBus::builder(store)
        .with_config(fast_config())
        .pipeline_step(step)
        .saga(FulfilmentSaga::default(), |registrar| {
            registrar
                .starts_with::<OrderPlaced>()
                .handles::<PaymentReceived>();
        })
        .queue(orders_queue())
        .build()
        .unwrap()
}

/// Logs and drops any failure from the rest of the chain
struct SwallowErrorsStep;

#[async_trait]
impl PipelineStep for SwallowErrorsStep {
    fn priority(&self) -> i32 {
        1
    }

    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<(), HandlerError> {
        if let Err(error) = next.run(ctx).await {
            tracing::warn!(message_id = %ctx.message_id, error = %error, "dropping handler error");
        }
        Ok(())
    }
}

/// Simulates another worker taking the saga over once this dispatch's lease
/// has run out
struct LeaseTakeoverStep {
    store: Arc<MemoryMessageStore>,
    key: &'static str,
}

#[async_trait]
impl PipelineStep for LeaseTakeoverStep {
    fn priority(&self) -> i32 {
        1
    }

    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<(), HandlerError> {
        next.run(ctx).await?;
        let lock = self
            .store
            .acquire_saga_lock(&fulfilment(), &key(self.key), Duration::ZERO, None)
            .await?;
        assert!(matches!(lock, SagaLock::Acquired { created: false, .. }));
        Ok(())
    }
}

async fn send_order(bus: &MessageBus, message: OrderPlaced) {
    bus.producer()
        .enqueue(&orders_queue(), &message, EnqueueOptions::default())
        .await
        .unwrap();
}

async fn send_payment(bus: &MessageBus, message: PaymentReceived) {
    bus.producer()
        .enqueue(&orders_queue(), &message, EnqueueOptions::default())
        .await
        .unwrap();
}

async fn process(bus: &MessageBus) -> ProcessOutcome {
    bus.processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap()
}

async fn saga_data(store: &MemoryMessageStore, order_id: &str) -> Option<FulfilmentData> {
    store
        .load_saga(&fulfilment(), &key(order_id))
        .await
        .unwrap()
        .map(|record| serde_json::from_str(&record.data).unwrap())
}

#[tokio::test]
async fn test_messages_with_same_key_reach_one_instance() {
    let store = memory_store();
    let saga = FulfilmentSaga::default();
    let bus = saga_bus(store.clone(), saga.clone(), fast_config());

    send_order(&bus, order("K", 100)).await;
    send_payment(&bus, payment("K", 30)).await;

    assert!(matches!(process(&bus).await, ProcessOutcome::Completed { .. }));
    assert!(matches!(process(&bus).await, ProcessOutcome::Completed { .. }));

    let data = saga_data(&store, "K").await.unwrap();
    assert_eq!(data.amount_due, 100);
    assert_eq!(data.amount_paid, 30);
    assert_eq!(data.events, vec!["placed:100", "paid:30"]);

    let record = store.load_saga(&fulfilment(), &key("K")).await.unwrap().unwrap();
    assert!(!record.blocked);
    assert!(record.blocked_at.is_none());

    // key mapping is configured once per saga type, not per message
    assert_eq!(saga.configure_calls(), 1);
}

#[tokio::test]
async fn test_distinct_keys_get_distinct_instances() {
    let store = memory_store();
    let bus = saga_bus(store.clone(), FulfilmentSaga::default(), fast_config());

    send_order(&bus, order("A", 10)).await;
    send_order(&bus, order("B", 20)).await;
    process(&bus).await;
    process(&bus).await;

    let a = store.load_saga(&fulfilment(), &key("A")).await.unwrap().unwrap();
    let b = store.load_saga(&fulfilment(), &key("B")).await.unwrap().unwrap();
    assert_ne!(a.saga_id, b.saga_id);
    assert_eq!(saga_data(&store, "B").await.unwrap().amount_due, 20);
}

#[tokio::test]
async fn test_completed_saga_is_deleted_and_sends_outgoing() {
    let store = memory_store();
    let invoices = workbus::store::MessageTarget::queue(invoices_queue());
    let bus = saga_bus(store.clone(), FulfilmentSaga::default(), fast_config());

    send_order(&bus, order("Z", 50)).await;
    send_payment(&bus, payment("Z", 20)).await;
    send_payment(&bus, payment("Z", 30)).await;

    process(&bus).await;
    process(&bus).await;
    assert!(saga_data(&store, "Z").await.is_some());

    let outcome = process(&bus).await;
    assert!(matches!(outcome, ProcessOutcome::Completed { outgoing: 1, .. }));
    assert!(saga_data(&store, "Z").await.is_none());

    let invoice = single_row(&store, &invoices, MessageState::Pending);
    assert_eq!(headers_of(&invoice).message_class, "billing.invoice_requested");
}

#[tokio::test]
async fn test_message_for_unstarted_saga_is_retried() {
    let store = memory_store();
    let bus = saga_bus(store.clone(), FulfilmentSaga::default(), fast_config());

    send_payment(&bus, payment("nobody", 10)).await;
    let outcome = process(&bus).await;

    assert!(matches!(outcome, ProcessOutcome::Retried { retries: 1, .. }));
    assert!(saga_data(&store, "nobody").await.is_none());
    let record = single_row(&store, &orders_target(), MessageState::Pending);
    assert!(headers_of(&record)
        .exception_details
        .unwrap()
        .contains("has not been started"));
}

#[tokio::test]
async fn test_locked_instance_defers_without_counting_a_failure() {
    let store = memory_store();
    let bus = saga_bus(store.clone(), FulfilmentSaga::default(), fast_config());

    send_order(&bus, order("L", 40)).await;
    process(&bus).await;

    // another message currently holds the instance
    let lock = store
        .acquire_saga_lock(&fulfilment(), &key("L"), Duration::from_secs(60), None)
        .await
        .unwrap();
    let held = match lock {
        SagaLock::Acquired { record, created } => {
            assert!(!created);
            record
        }
        other => panic!("expected to acquire the lock, got {other:?}"),
    };

    send_payment(&bus, payment("L", 40)).await;
    let outcome = process(&bus).await;
    assert!(matches!(outcome, ProcessOutcome::Deferred { .. }));

    let pending = single_row(&store, &orders_target(), MessageState::Pending);
    assert_eq!(pending.retries, 0);
    assert!(headers_of(&pending).exception_details.is_none());

    store
        .release_saga_lock(&fulfilment(), held.id, held.blocked_at.unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(process(&bus).await, ProcessOutcome::Completed { .. }));
    assert!(saga_data(&store, "L").await.is_none());
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let store = memory_store();
    let mut config = fast_config();
    config.saga.lock_lease_ms = 5;
    let bus = saga_bus(store.clone(), FulfilmentSaga::default(), config);

    send_order(&bus, order("E", 10)).await;
    process(&bus).await;

    // simulate a worker that crashed while holding the lock
    let lock = store
        .acquire_saga_lock(&fulfilment(), &key("E"), Duration::from_millis(5), None)
        .await
        .unwrap();
    assert!(matches!(lock, SagaLock::Acquired { .. }));
    tokio::time::sleep(Duration::from_millis(20)).await;

    send_payment(&bus, payment("E", 10)).await;
    assert!(matches!(process(&bus).await, ProcessOutcome::Completed { .. }));
    assert!(saga_data(&store, "E").await.is_none());
}

#[tokio::test]
async fn test_failed_saga_message_releases_lock() {
    let store = memory_store();
    let bus = saga_bus(store.clone(), FulfilmentSaga::default(), fast_config());

    send_order(&bus, order("F", 40)).await;
    process(&bus).await;

    send_payment(&bus, payment("F", 0)).await;
    assert!(matches!(process(&bus).await, ProcessOutcome::Retried { .. }));

    let record = store.load_saga(&fulfilment(), &key("F")).await.unwrap().unwrap();
    assert!(!record.blocked);
    assert_eq!(saga_data(&store, "F").await.unwrap().amount_paid, 0);
}

#[tokio::test]
async fn test_failed_start_leaves_no_instance_behind() {
    let store = memory_store();
    let bus = saga_bus(store.clone(), FulfilmentSaga::default(), fast_config());

    send_order(&bus, order("S", 0)).await;
    assert!(matches!(process(&bus).await, ProcessOutcome::Retried { .. }));
    assert!(saga_data(&store, "S").await.is_none());

    // a later, valid start for the same key creates the instance normally
    let lock = store
        .acquire_saga_lock(
            &fulfilment(),
            &key("S"),
            Duration::from_secs(60),
            Some(NewSagaRow {
                saga_id: Uuid::new_v4(),
                data: "{}".to_string(),
                metadata: "{}".to_string(),
            }),
        )
        .await
        .unwrap();
    assert!(matches!(lock, SagaLock::Acquired { created: true, .. }));
}

#[tokio::test]
async fn test_saga_with_invalid_name_is_rejected_at_build() {
    #[derive(Clone, Default)]
    struct BadlyNamed;

    impl workbus::saga::Saga for BadlyNamed {
        type Data = FulfilmentData;

        fn saga_name() -> &'static str {
            "Bad Name"
        }

        fn configure_message_keys(&self, _mapper: &mut workbus::saga::SagaKeyMapper) {}
    }

    let result = MessageBus::builder(memory_store())
        .saga(BadlyNamed, |_registrar| {})
        .build();
    assert!(matches!(result, Err(BusError::Validation(_))));
}

#[tokio::test]
async fn test_registering_a_message_twice_for_one_saga_is_rejected() {
    let result = MessageBus::builder(memory_store())
        .saga(FulfilmentSaga::default(), |registrar| {
            registrar
                .starts_with::<OrderPlaced>()
                .handles::<OrderPlaced>();
        })
        .build();
    assert!(matches!(result, Err(BusError::Configuration(_))));
}

#[tokio::test]
async fn test_step_swallowing_saga_failure_still_releases_lock() {
    let store = memory_store();
    let bus = saga_bus_with_step(store.clone(), SwallowErrorsStep);

    send_order(&bus, order("P", 40)).await;
    assert!(matches!(process(&bus).await, ProcessOutcome::Completed { .. }));

    // the payment fails inside the saga but the step completes the message
    send_payment(&bus, payment("P", 0)).await;
    assert!(matches!(process(&bus).await, ProcessOutcome::Completed { .. }));

    let record = store.load_saga(&fulfilment(), &key("P")).await.unwrap().unwrap();
    assert!(!record.blocked);
    assert!(record.blocked_at.is_none());
    assert_eq!(saga_data(&store, "P").await.unwrap().amount_paid, 0);

    // the next message for the key is not held up by a stale lock
    send_payment(&bus, payment("P", 40)).await;
    assert!(matches!(process(&bus).await, ProcessOutcome::Completed { outgoing: 1, .. }));
    assert!(saga_data(&store, "P").await.is_none());
}

#[tokio::test]
async fn test_open_saga_store_breaker_defers_without_counting_retries() {
    let store = memory_store();
    let mut config = fast_config();
    config.circuit_breakers.cooldown_ms = 20;
    config.circuit_breakers.max_cooldown_ms = 40;
    let bus = saga_bus(store.clone(), FulfilmentSaga::default(), config);
    let saga_breaker = bus.breakers().get_circuit_breaker(&BreakerKey::SAGA_STORE);

    send_order(&bus, order("X", 10)).await;
    saga_breaker.force_open();

    let outcome = process(&bus).await;
    let ProcessOutcome::Deferred {
        delay, category, ..
    } = outcome
    else {
        panic!("expected deferral, got {outcome:?}");
    };
    assert_eq!(category, ErrorCategory::Resource);
    assert!(delay <= Duration::from_millis(20));

    let pending = single_row(&store, &orders_target(), MessageState::Pending);
    assert_eq!(pending.retries, 0);
    assert!(headers_of(&pending).exception_details.is_none());
    assert!(store.rows(&orders_target(), MessageState::Failed).is_empty());

    // once the cooldown passes the trial call succeeds and the saga starts
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(matches!(process(&bus).await, ProcessOutcome::Completed { .. }));
    assert_eq!(saga_data(&store, "X").await.unwrap().amount_due, 10);
}

#[tokio::test]
async fn test_lost_lease_rolls_back_stale_saga_write() {
    let store = memory_store();
    let bus = saga_bus_with_step(
        store.clone(),
        LeaseTakeoverStep {
            store: store.clone(),
            key: "T",
        },
    );

    // the takeover happens after this row is created, so the start is lost too
    send_order(&bus, order("T", 25)).await;
    let error = bus
        .processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap_err();
    assert!(matches!(error, BusError::Store(StoreError::SagaLockLost { .. })));

    // the new holder keeps its lock and the stale data was never written
    let record = store.load_saga(&fulfilment(), &key("T")).await.unwrap().unwrap();
    assert!(record.blocked);
    assert_eq!(saga_data(&store, "T").await.unwrap(), FulfilmentData::default());

    let pending = single_row(&store, &orders_target(), MessageState::Pending);
    assert_eq!(pending.retries, 0);
    assert!(store.rows(&orders_target(), MessageState::Completed).is_empty());
}
