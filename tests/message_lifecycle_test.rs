//! Message lifecycle through `MessageProcessor`: completion, retry scheduling,
//! terminal failure, transactional sends and the pipeline around dispatch.

mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use workbus::constants::headers::{CONVERSATION_ID, CORRELATION_ID};
use workbus::messaging::MessageState;
use workbus::orchestration::{EnqueueOptions, MessageBus, ProcessOutcome};
use workbus::pipeline::{MessageContext, Next, PipelineStep};
use workbus::registry::Handler;
use workbus::resilience::{BreakerKey, CircuitState};
use workbus::retry::{ExponentialBackoffStrategy, FailureCount, FnRetryStrategy, RetryResult};
use workbus::store::{MessageStore, MessageTarget, StoreError};
use workbus::{BusError, ErrorCategory, HandlerError};

fn next_wait() -> Duration {
    Duration::from_millis(15)
}

#[tokio::test]
async fn test_successful_message_moves_to_completed() {
    let store = memory_store();
    let recorder = RecordingHandler::default();
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(recorder.clone())
        .queue(orders_queue())
        .build()
        .unwrap();

    let message_id = bus
        .producer()
        .enqueue(&orders_queue(), &order("A-1", 40), EnqueueOptions::default())
        .await
        .unwrap();

    let processor = bus.processor_for(&orders_target()).unwrap();
    let outcome = processor.process_next().await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Completed {
            message_id: message_id.as_uuid(),
            outgoing: 0
        }
    );
    assert_eq!(recorder.seen(), vec!["A-1".to_string()]);

    let record = single_row(&store, &orders_target(), MessageState::Completed);
    assert!(record.completed.is_some());
    assert!(record.failed.is_none());
    assert!(store.rows(&orders_target(), MessageState::Pending).is_empty());

    assert_eq!(processor.process_next().await.unwrap(), ProcessOutcome::Idle);
}

#[tokio::test]
async fn test_messages_are_claimed_by_priority_then_insertion() {
    let store = memory_store();
    let recorder = RecordingHandler::default();
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(recorder.clone())
        .queue(orders_queue())
        .build()
        .unwrap();
    let producer = bus.producer();

    for (id, priority) in [("low", 0), ("high-1", 5), ("high-2", 5)] {
        producer
            .enqueue(
                &orders_queue(),
                &order(id, 1),
                EnqueueOptions::default().with_priority(priority),
            )
            .await
            .unwrap();
    }
    producer
        .enqueue(
            &orders_queue(),
            &order("later", 1),
            EnqueueOptions::default()
                .with_priority(100)
                .not_before(Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    let processor = bus.processor_for(&orders_target()).unwrap();
    while processor.process_next().await.unwrap() != ProcessOutcome::Idle {}

    assert_eq!(recorder.seen(), vec!["high-1", "high-2", "low"]);
    assert_eq!(
        store
            .count_messages(&orders_target(), MessageState::Pending)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_three_failures_schedule_third_backoff_delay() {
    let store = memory_store();
    let config = fast_config();
    let backoff = ExponentialBackoffStrategy::from_config(&config.retry);
    let flaky = FlakyHandler::always_failing();
    let bus = MessageBus::builder(store.clone())
        .with_config(config)
        .handle::<OrderPlaced, _>(flaky.clone())
        .queue(orders_queue())
        .build()
        .unwrap();

    bus.producer()
        .enqueue(&orders_queue(), &order("R-1", 10), EnqueueOptions::default())
        .await
        .unwrap();
    let processor = bus.processor_for(&orders_target()).unwrap();

    for expected in 1..=2 {
        match processor.process_next().await.unwrap() {
            ProcessOutcome::Retried { retries, .. } => assert_eq!(retries, expected),
            other => panic!("expected a retry, got {other:?}"),
        }
        tokio::time::sleep(next_wait()).await;
    }

    let before = Utc::now();
    let outcome = processor.process_next().await.unwrap();
    let after = Utc::now();
    let third_delay = backoff.delay(FailureCount::new(3).unwrap());
    assert!(matches!(
        outcome,
        ProcessOutcome::Retried { retries: 3, delay, .. } if delay == third_delay
    ));

    let record = single_row(&store, &orders_target(), MessageState::Pending);
    let delay = chrono::Duration::from_std(third_delay).unwrap();
    assert_eq!(record.retries, 3);
    assert!(record.not_before >= before + delay);
    assert!(record.not_before <= after + delay);
    assert!(headers_of(&record)
        .exception_details
        .unwrap()
        .contains("inventory service unreachable"));
    assert_eq!(flaky.attempts(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_with_exception_details() {
    let store = memory_store();
    let failed = CollectingFailedHandler::default();
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(FlakyHandler::always_failing())
        .queue(orders_queue())
        .failed_message_handler_for(orders_target(), failed.clone())
        .build()
        .unwrap();

    let message_id = bus
        .producer()
        .enqueue(&orders_queue(), &order("X-9", 10), EnqueueOptions::default())
        .await
        .unwrap();
    let processor = bus.processor_for(&orders_target()).unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..10 {
        let outcome = processor.process_next().await.unwrap();
        let done = matches!(outcome, ProcessOutcome::Failed { .. });
        outcomes.push(outcome);
        if done {
            break;
        }
        tokio::time::sleep(next_wait()).await;
    }

    // max_retries = 3: three retries, then the fourth failure is terminal
    assert_eq!(outcomes.len(), 4);
    assert_eq!(
        outcomes.last(),
        Some(&ProcessOutcome::Failed {
            message_id: message_id.as_uuid(),
            category: ErrorCategory::Transient
        })
    );

    let record = single_row(&store, &orders_target(), MessageState::Failed);
    assert!(record.failed.is_some());
    assert!(record.completed.is_none());
    assert_eq!(record.retries, 3);
    let headers = headers_of(&record);
    assert_eq!(headers.message_class, "orders.placed");
    assert!(headers
        .exception_details
        .unwrap()
        .contains("inventory service unreachable for X-9"));

    let failures = failed.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].message_id, message_id.as_uuid());
    assert_eq!(failures[0].target, orders_target());
    assert_eq!(failures[0].category, ErrorCategory::Transient);
}

#[tokio::test]
async fn test_recovering_handler_completes_after_retry() {
    let store = memory_store();
    let flaky = FlakyHandler::failing(1);
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(flaky.clone())
        .queue(orders_queue())
        .build()
        .unwrap();

    bus.producer()
        .enqueue(&orders_queue(), &order("F-1", 5), EnqueueOptions::default())
        .await
        .unwrap();
    let processor = bus.processor_for(&orders_target()).unwrap();

    assert!(matches!(
        processor.process_next().await.unwrap(),
        ProcessOutcome::Retried { retries: 1, .. }
    ));
    tokio::time::sleep(next_wait()).await;
    assert!(matches!(
        processor.process_next().await.unwrap(),
        ProcessOutcome::Completed { .. }
    ));

    let record = single_row(&store, &orders_target(), MessageState::Completed);
    assert_eq!(record.retries, 1);
    assert_eq!(flaky.attempts(), 2);
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let store = memory_store();
    let failed = CollectingFailedHandler::default();
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(RejectingHandler)
        .queue(orders_queue())
        .failed_message_handler_for(orders_target(), failed.clone())
        .build()
        .unwrap();

    bus.producer()
        .enqueue(&orders_queue(), &order("P-1", 5), EnqueueOptions::default())
        .await
        .unwrap();
    let outcome = bus
        .processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            category: ErrorCategory::Permanent,
            ..
        }
    ));
    assert_eq!(single_row(&store, &orders_target(), MessageState::Failed).retries, 0);
    assert_eq!(failed.failures().len(), 1);
}

#[tokio::test]
async fn test_per_target_retry_strategy_overrides_default() {
    let store = memory_store();
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(FlakyHandler::always_failing())
        .queue(orders_queue())
        .retry_strategy_for(
            orders_target(),
            FnRetryStrategy::new(|_, _, _| RetryResult::give_up()),
        )
        .build()
        .unwrap();

    bus.producer()
        .enqueue(&orders_queue(), &order("G-1", 5), EnqueueOptions::default())
        .await
        .unwrap();
    let outcome = bus
        .processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            category: ErrorCategory::Transient,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unrecognized_class_fails_without_retry() {
    let store = memory_store();
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(RecordingHandler::default())
        .queue(orders_queue())
        .build()
        .unwrap();

    enqueue_raw(&store, &orders_queue(), "ghost.message", serde_json::json!({})).await;
    let outcome = bus
        .processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            category: ErrorCategory::Configuration,
            ..
        }
    ));
    let record = single_row(&store, &orders_target(), MessageState::Failed);
    assert_eq!(record.retries, 0);
    assert!(headers_of(&record)
        .exception_details
        .unwrap()
        .contains("'ghost.message' is not recognized"));
}

#[tokio::test]
async fn test_subscribed_only_type_on_queue_is_kind_mismatch() {
    let store = memory_store();
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .subscribed_message::<OrderShipped>()
        .handle::<OrderPlaced, _>(RecordingHandler::default())
        .queue(orders_queue())
        .build()
        .unwrap();

    enqueue_raw(
        &store,
        &orders_queue(),
        "orders.shipped",
        serde_json::json!({ "order_id": "S-1" }),
    )
    .await;
    let outcome = bus
        .processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            category: ErrorCategory::Configuration,
            ..
        }
    ));
    let record = single_row(&store, &orders_target(), MessageState::Failed);
    assert!(headers_of(&record)
        .exception_details
        .unwrap()
        .contains("not registered as a queue message"));
}

#[tokio::test]
async fn test_type_without_handler_fails_as_configuration_error() {
    let store = memory_store();
    let invoices = MessageTarget::queue(invoices_queue());
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .queue_message::<InvoiceRequested>()
        .queue(invoices_queue())
        .build()
        .unwrap();

    bus.producer()
        .enqueue(
            &invoices_queue(),
            &InvoiceRequested {
                order_id: "N-1".to_string(),
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    let outcome = bus
        .processor_for(&invoices)
        .unwrap()
        .process_next()
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            category: ErrorCategory::Configuration,
            ..
        }
    ));
    assert!(headers_of(&single_row(&store, &invoices, MessageState::Failed))
        .exception_details
        .unwrap()
        .contains("no handler registered"));
}

#[tokio::test]
async fn test_malformed_body_is_retried_as_transient() {
    let store = memory_store();
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(RecordingHandler::default())
        .queue(orders_queue())
        .build()
        .unwrap();

    enqueue_raw(
        &store,
        &orders_queue(),
        "orders.placed",
        serde_json::json!({ "order_id": 17 }),
    )
    .await;
    let outcome = bus
        .processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Retried { retries: 1, .. }));
}

#[tokio::test]
async fn test_outgoing_messages_commit_with_completion() {
    let store = memory_store();
    let invoices = MessageTarget::queue(invoices_queue());
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(InvoicingHandler {
            fail_after_send: false,
        })
        .queue(orders_queue())
        .build()
        .unwrap();

    let parent_id = bus
        .producer()
        .enqueue(
            &orders_queue(),
            &order("O-1", 25),
            EnqueueOptions::default()
                .new_conversation()
                .with_trace_parent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
        )
        .await
        .unwrap();
    let parent_headers = headers_of(&single_row(&store, &orders_target(), MessageState::Pending));

    let outcome = bus
        .processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed { outgoing: 1, .. }));

    let invoice = single_row(&store, &invoices, MessageState::Pending);
    let headers = headers_of(&invoice);
    assert_eq!(headers.message_class, "billing.invoice_requested");
    assert_eq!(
        headers.user_headers.get(CORRELATION_ID),
        Some(parent_id.to_string().as_str())
    );
    assert_eq!(
        headers.user_headers.get(CONVERSATION_ID),
        parent_headers.user_headers.get(CONVERSATION_ID)
    );
    assert_eq!(headers.user_headers.get("origin"), Some("invoicing"));
    assert_eq!(
        headers.diagnostics.trace_parent,
        parent_headers.diagnostics.trace_parent
    );
    assert!(!headers.diagnostics.new_trace);

    let body: InvoiceRequested = serde_json::from_str(&invoice.body).unwrap();
    assert_eq!(body.order_id, "O-1");
}

#[tokio::test]
async fn test_outgoing_messages_are_discarded_on_failure() {
    let store = memory_store();
    let invoices = MessageTarget::queue(invoices_queue());
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(InvoicingHandler {
            fail_after_send: true,
        })
        .queue(orders_queue())
        .build()
        .unwrap();

    bus.producer()
        .enqueue(&orders_queue(), &order("O-2", 25), EnqueueOptions::default())
        .await
        .unwrap();
    let outcome = bus
        .processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap();

    assert!(matches!(outcome, ProcessOutcome::Retried { .. }));
    assert!(store.rows(&invoices, MessageState::Pending).is_empty());
}

struct TracingStep {
    priority: i32,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PipelineStep for TracingStep {
    fn priority(&self) -> i32 {
        self.priority
    }

    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<(), HandlerError> {
        self.log.lock().push(format!("enter:{}", self.priority));
        ctx.set_item("last_step", serde_json::json!(self.priority));
        let result = next.run(ctx).await;
        self.log.lock().push(format!("exit:{}", self.priority));
        result
    }
}

struct LoggingHandler {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Handler<OrderPlaced> for LoggingHandler {
    async fn handle(&self, _message: &OrderPlaced, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        let last_step = ctx.item("last_step").cloned().unwrap_or_default();
        self.log.lock().push(format!("handler:{last_step}"));
        Ok(())
    }
}

#[tokio::test]
async fn test_pipeline_steps_wrap_handlers_in_priority_order() {
    let store = memory_store();
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .pipeline_step(TracingStep {
            priority: 10,
            log: Arc::clone(&log),
        })
        .pipeline_step(TracingStep {
            priority: -5,
            log: Arc::clone(&log),
        })
        .handle::<OrderPlaced, _>(LoggingHandler {
            log: Arc::clone(&log),
        })
        .queue(orders_queue())
        .build()
        .unwrap();

    bus.producer()
        .enqueue(&orders_queue(), &order("L-1", 1), EnqueueOptions::default())
        .await
        .unwrap();
    bus.processor_for(&orders_target())
        .unwrap()
        .process_next()
        .await
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec!["enter:-5", "enter:10", "handler:10", "exit:10", "exit:-5"]
    );
}

#[tokio::test]
async fn test_store_outage_trips_message_store_breaker() {
    let store = memory_store();
    let mut config = fast_config();
    config.circuit_breakers.failure_threshold = 2;
    let bus = MessageBus::builder(store.clone())
        .with_config(config)
        .handle::<OrderPlaced, _>(RecordingHandler::default())
        .queue(orders_queue())
        .build()
        .unwrap();

    bus.producer()
        .enqueue(&orders_queue(), &order("C-1", 1), EnqueueOptions::default())
        .await
        .unwrap();
    store.set_unavailable(true);

    let processor = bus.processor_for(&orders_target()).unwrap();
    for _ in 0..2 {
        let error = processor.process_next().await.unwrap_err();
        assert!(matches!(error, BusError::Store(_)));
        assert_eq!(error.category(), ErrorCategory::Resource);
    }

    let error = processor.process_next().await.unwrap_err();
    assert!(matches!(error, BusError::CircuitOpen { .. }));
    assert_eq!(
        bus.breakers()
            .get_circuit_breaker(&BreakerKey::MESSAGE_STORE)
            .state(),
        CircuitState::Open
    );

    store.set_unavailable(false);
    assert_eq!(store.rows(&orders_target(), MessageState::Pending).len(), 1);
}

#[tokio::test]
async fn test_published_event_is_processed_per_subscriber() {
    let store = memory_store();
    let recorder = RecordingHandler::default();
    let subscription = MessageTarget::subscriber(shipping_topic(), notifier());
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle_subscribed::<OrderShipped, _>(recorder.clone())
        .subscription(shipping_topic(), notifier())
        .build()
        .unwrap();
    let producer = bus.producer();

    let before_subscribing = producer
        .publish(
            &shipping_topic(),
            &OrderShipped {
                order_id: "early".to_string(),
            },
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(before_subscribing, 0);

    producer.subscribe(&shipping_topic(), &notifier()).await.unwrap();
    let targeted = producer
        .publish(
            &shipping_topic(),
            &OrderShipped {
                order_id: "T-1".to_string(),
            },
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(targeted, 1);

    let outcome = bus
        .processor_for(&subscription)
        .unwrap()
        .process_next()
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
    assert_eq!(recorder.seen(), vec!["T-1".to_string()]);
    assert_eq!(store.rows(&subscription, MessageState::Completed).len(), 1);
}

#[tokio::test]
async fn test_build_reports_registration_errors() {
    let result = MessageBus::builder(memory_store())
        .handle::<OrderPlaced, _>(RecordingHandler::default())
        .failed_message_handler_for(orders_target(), CollectingFailedHandler::default())
        .build();
    assert!(matches!(result, Err(BusError::Configuration(_))));

    let mut config = fast_config();
    config.polling.idle_delay_ms = 0;
    let result = MessageBus::builder(memory_store())
        .with_config(config)
        .queue(orders_queue())
        .build();
    assert!(matches!(result, Err(BusError::Configuration(_))));
}

/// Depends on a downstream store that is currently down
struct StoreDownHandler;

#[async_trait]
impl Handler<OrderPlaced> for StoreDownHandler {
    async fn handle(&self, _message: &OrderPlaced, _ctx: &mut MessageContext) -> Result<(), HandlerError> {
        Err(StoreError::unavailable("reserve_stock", "connection refused").into())
    }
}

#[tokio::test]
async fn test_unavailable_store_in_handler_defers_instead_of_exhausting_retries() {
    let store = memory_store();
    let bus = MessageBus::builder(store.clone())
        .with_config(fast_config())
        .handle::<OrderPlaced, _>(StoreDownHandler)
        .queue(orders_queue())
        .build()
        .unwrap();
    bus.producer()
        .enqueue(&orders_queue(), &order("R-1", 3), EnqueueOptions::default())
        .await
        .unwrap();
    let processor = bus.processor_for(&orders_target()).unwrap();

    // more attempts than max_retries allows
    for _ in 0..5 {
        let outcome = processor.process_next().await.unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::Deferred {
                category: ErrorCategory::Resource,
                ..
            }
        ));
        tokio::time::sleep(next_wait()).await;
    }

    let pending = single_row(&store, &orders_target(), MessageState::Pending);
    assert_eq!(pending.retries, 0);
    assert!(headers_of(&pending).exception_details.is_none());
    assert!(store.rows(&orders_target(), MessageState::Failed).is_empty());
}
