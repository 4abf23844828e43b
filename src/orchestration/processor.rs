//! # Message Processor
//!
//! Processes one message per call: claim, decode, dispatch through the
//! pipeline, then a single terminal write, all inside one unit of work. A
//! crash anywhere before commit leaves the message pending for another
//! attempt.
//!
//! Failure handling by [`ErrorCategory`]:
//!
//! - `Configuration`: failed immediately, retry policy not consulted
//! - `Deferred`: rescheduled after the saga lock retry delay, retries unchanged
//! - `Resource`: rescheduled after the breaker's remaining cooldown, retries
//!   unchanged
//! - everything else: the retry strategy decides between a delayed retry and
//!   a terminal failure with `ExceptionDetails` in the headers

use super::failed::{FailedMessage, FailedMessageHandler};
use crate::constants::headers::{CONVERSATION_ID, CORRELATION_ID};
use crate::constants::limits::MAX_RETRIES_STORED;
use crate::error::{BusError, ErrorCategory, HandlerError};
use crate::identity::ClassResolver;
use crate::logging::{duration_ms, log_message_operation};
use crate::messaging::{Destination, Headers, NewMessage, OutgoingMessage, QueueMessageRecord};
use crate::pipeline::{HeldSagaLock, MessageContext, Pipeline, SagaWrite};
use crate::resilience::CircuitBreaker;
use crate::retry::{FailureCount, RetryContext, RetryStrategy};
use crate::saga::SagaProcessor;
use crate::serialization::{SerializationError, Serializer, SerializerExt};
use crate::store::{MessageStore, MessageTarget, StoreError, StoreResult, UnitOfWork};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// What one call to [`MessageProcessor::process_next`] did
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Nothing eligible
    Idle,
    Completed {
        message_id: Uuid,
        outgoing: usize,
    },
    Retried {
        message_id: Uuid,
        retries: i16,
        delay: Duration,
    },
    /// A saga instance was locked or a store was unavailable; retried later
    /// without counting a failure
    Deferred {
        message_id: Uuid,
        delay: Duration,
        category: ErrorCategory,
    },
    Failed {
        message_id: Uuid,
        category: ErrorCategory,
    },
}

enum Disposition {
    Complete {
        outgoing: Vec<OutgoingMessage>,
        saga_writes: Vec<SagaWrite>,
    },
    Retry {
        retries: i16,
        delay: Duration,
        error: HandlerError,
    },
    Defer {
        delay: Duration,
        category: ErrorCategory,
    },
    Fail {
        error: HandlerError,
    },
}

/// Collaborators shared by every processor of one bus
pub(crate) struct ProcessorComponents {
    pub store: Arc<dyn MessageStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub resolver: Arc<dyn ClassResolver>,
    pub serializer: Arc<dyn Serializer>,
    pub saga_processor: Arc<SagaProcessor>,
    pub saga_retry_delay: Duration,
    pub subscription_retention: Duration,
}

/// Processes messages for one queue or subscription
pub struct MessageProcessor {
    target: MessageTarget,
    pipeline: Pipeline,
    retry_strategy: Arc<dyn RetryStrategy>,
    failed_handler: Option<Arc<dyn FailedMessageHandler>>,
    store: Arc<dyn MessageStore>,
    breaker: Arc<CircuitBreaker>,
    resolver: Arc<dyn ClassResolver>,
    serializer: Arc<dyn Serializer>,
    saga_processor: Arc<SagaProcessor>,
    saga_retry_delay: Duration,
    subscription_retention: Duration,
}

impl MessageProcessor {
    pub(crate) fn new(
        target: MessageTarget,
        pipeline: Pipeline,
        retry_strategy: Arc<dyn RetryStrategy>,
        failed_handler: Option<Arc<dyn FailedMessageHandler>>,
        components: ProcessorComponents,
    ) -> Self {
        Self {
            target,
            pipeline,
            retry_strategy,
            failed_handler,
            store: components.store,
            breaker: components.breaker,
            resolver: components.resolver,
            serializer: components.serializer,
            saga_processor: components.saga_processor,
            saga_retry_delay: components.saga_retry_delay,
            subscription_retention: components.subscription_retention,
        }
    }

    pub fn target(&self) -> &MessageTarget {
        &self.target
    }

    /// Breaker guarding the message store
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Claim and fully process the next eligible message
    #[instrument(skip(self), fields(target = %self.target))]
    pub async fn process_next(&self) -> Result<ProcessOutcome, BusError> {
        let now = Utc::now();
        let mut uow = self.guarded(self.store.begin()).await?;

        let Some(claimed) = self.guarded(uow.claim_next(&self.target, now)).await? else {
            self.guarded(uow.rollback()).await?;
            return Ok(ProcessOutcome::Idle);
        };
        let record = claimed.record().clone();

        let parsed_headers = self.serializer.deserialize_headers(&record.headers);
        let headers = parsed_headers.as_ref().ok().cloned().unwrap_or_default();

        let (result, mut ctx) = match parsed_headers {
            Ok(parsed) => match self.prepare(&record, parsed) {
                Ok(mut ctx) => {
                    let result = self.pipeline.run(&mut ctx).await;
                    (result, Some(ctx))
                }
                Err(error) => (Err(error), None),
            },
            Err(error) => (Err(error.into()), None),
        };

        let mut saga_locks = ctx
            .as_mut()
            .map(MessageContext::take_saga_locks)
            .unwrap_or_default();
        // locks cleared by this unit of work's own saga writes once it commits
        let mut committed_locks: Vec<HeldSagaLock> = Vec::new();

        let disposition = match result {
            Ok(()) => {
                let (outgoing, saga_writes) = ctx
                    .as_mut()
                    .map(|ctx| (ctx.take_outgoing(), ctx.take_saga_writes()))
                    .unwrap_or_default();
                // a step may swallow a saga failure; its lock has no write
                (committed_locks, saga_locks) = saga_locks
                    .into_iter()
                    .partition(|lock| saga_writes.iter().any(|write| write.clears(lock)));
                Disposition::Complete {
                    outgoing,
                    saga_writes,
                }
            }
            Err(error) => self.decide_failure(&record, &headers, error),
        };

        let written = match self.write_disposition(&mut uow, &record, &headers, disposition, now).await {
            Ok(written) => written,
            Err(e) => {
                drop(uow);
                saga_locks.append(&mut committed_locks);
                self.saga_processor.release(saga_locks).await;
                return Err(e);
            }
        };

        if let Err(e) = self.guarded(uow.commit()).await {
            error!(message_id = %record.message_id, error = %e, "❌ Failed to commit message outcome");
            saga_locks.append(&mut committed_locks);
            self.saga_processor.release(saga_locks).await;
            return Err(e);
        }

        self.saga_processor.release(saga_locks).await;

        if let Some(failure) = written.failure {
            log_message_operation(
                "fail",
                &self.target.to_string(),
                Some(record.message_id),
                Some(failure.headers.message_class.as_str()),
                "failed",
                Some(&failure.error),
            );
            if let Some(handler) = &self.failed_handler {
                handler.on_failed(&failure).await;
            }
        }

        Ok(written.outcome)
    }

    fn prepare(
        &self,
        record: &QueueMessageRecord,
        headers: Headers,
    ) -> Result<MessageContext, HandlerError> {
        let entry = self.resolver.resolve(&headers.message_class).ok_or_else(|| {
            HandlerError::ClassNotRecognized {
                class: headers.message_class.clone(),
            }
        })?;

        let kind = self.target.kind();
        if !entry.supports(kind) {
            return Err(HandlerError::KindMismatch {
                class: headers.message_class.clone(),
                expected: kind,
            });
        }

        let body = self.serializer.deserialize_entry(&record.body, &entry)?;
        Ok(MessageContext::new(
            record.message_id,
            record.id,
            self.target.clone(),
            headers,
            record.retries,
            record.enqueued,
            entry,
            body,
        ))
    }

    fn decide_failure(
        &self,
        record: &QueueMessageRecord,
        headers: &Headers,
        error: HandlerError,
    ) -> Disposition {
        match error.category() {
            category @ (ErrorCategory::Deferred | ErrorCategory::Resource) => {
                return Disposition::Defer {
                    delay: error.retry_after().unwrap_or(self.saga_retry_delay),
                    category,
                }
            }
            ErrorCategory::Configuration => return Disposition::Fail { error },
            _ => {}
        }

        if record.retries >= MAX_RETRIES_STORED {
            return Disposition::Fail { error };
        }
        let Ok(failure_count) = FailureCount::new(i64::from(record.retries) + 1) else {
            return Disposition::Fail { error };
        };

        let context = RetryContext {
            target: self.target.clone(),
            message_id: record.message_id,
            message_class: headers.message_class.clone(),
            previous_retries: record.retries,
        };
        let decision = self
            .retry_strategy
            .determine_retry(&context, &error, failure_count);

        if decision.should_retry {
            Disposition::Retry {
                retries: record.retries + 1,
                delay: decision.delay,
                error,
            }
        } else {
            Disposition::Fail { error }
        }
    }

    async fn write_disposition(
        &self,
        uow: &mut Box<dyn UnitOfWork>,
        record: &QueueMessageRecord,
        headers: &Headers,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> Result<Written, BusError> {
        match disposition {
            Disposition::Complete {
                outgoing,
                saga_writes,
            } => {
                let count = outgoing.len();
                for message in outgoing {
                    let (destination, row) =
                        self.outgoing_row(headers, record.message_id, message, now)?;
                    match destination {
                        Destination::Queue(queue) => {
                            self.guarded(uow.enqueue(&queue, row)).await?;
                        }
                        Destination::Topic(topic) => {
                            let valid_until = after(now, self.subscription_retention);
                            self.guarded(uow.publish(&topic, row, valid_until)).await?;
                        }
                    }
                }
                for write in saga_writes {
                    match write {
                        SagaWrite::Save {
                            saga,
                            record_id,
                            locked_at,
                            data,
                            metadata,
                        } => {
                            self.guarded(uow.save_saga(&saga, record_id, locked_at, data, metadata))
                                .await?
                        }
                        SagaWrite::Delete {
                            saga,
                            record_id,
                            locked_at,
                        } => {
                            self.guarded(uow.delete_saga(&saga, record_id, locked_at))
                                .await?
                        }
                    }
                }
                self.guarded(uow.complete(&self.target, record.id, now))
                    .await?;

                debug!(message_id = %record.message_id, outgoing = count, "✅ Message completed");
                Ok(Written::outcome(ProcessOutcome::Completed {
                    message_id: record.message_id,
                    outgoing: count,
                }))
            }
            Disposition::Retry {
                retries,
                delay,
                error,
            } => {
                let updated = headers.with_exception(error.to_string());
                let text = self.serializer.serialize_headers(&updated)?;
                self.guarded(uow.reschedule(
                    &self.target,
                    record.id,
                    after(now, delay),
                    retries,
                    Some(text),
                ))
                .await?;

                warn!(
                    message_id = %record.message_id,
                    retries,
                    delay_ms = duration_ms(delay),
                    category = %error.category(),
                    error = %error,
                    "🔄 Message scheduled for retry"
                );
                Ok(Written::outcome(ProcessOutcome::Retried {
                    message_id: record.message_id,
                    retries,
                    delay,
                }))
            }
            Disposition::Defer { delay, category } => {
                self.guarded(uow.reschedule(
                    &self.target,
                    record.id,
                    after(now, delay),
                    record.retries,
                    None,
                ))
                .await?;

                debug!(
                    message_id = %record.message_id,
                    category = %category,
                    delay_ms = duration_ms(delay),
                    "⏳ Message deferred"
                );
                Ok(Written::outcome(ProcessOutcome::Deferred {
                    message_id: record.message_id,
                    delay,
                    category,
                }))
            }
            Disposition::Fail { error } => {
                let category = error.category();
                let updated = headers.with_exception(error.to_string());
                let text = self.serializer.serialize_headers(&updated)?;
                self.guarded(uow.fail(&self.target, record.id, now, text))
                    .await?;

                Ok(Written {
                    outcome: ProcessOutcome::Failed {
                        message_id: record.message_id,
                        category,
                    },
                    failure: Some(FailedMessage {
                        target: self.target.clone(),
                        message_id: record.message_id,
                        record_id: record.id,
                        headers: updated,
                        body: record.body.clone(),
                        retries: record.retries,
                        category,
                        error: error.to_string(),
                    }),
                })
            }
        }
    }

    /// Row for a message sent while handling `parent_id`, carrying its
    /// conversation and trace forward
    fn outgoing_row(
        &self,
        parent: &Headers,
        parent_id: Uuid,
        message: OutgoingMessage,
        now: DateTime<Utc>,
    ) -> Result<(Destination, NewMessage), BusError> {
        let mut headers = Headers::for_class(message.message_class);
        headers.diagnostics.trace_parent = parent.diagnostics.trace_parent.clone();
        if let Some(conversation) = parent.user_headers.get(CONVERSATION_ID) {
            headers.user_headers.insert(CONVERSATION_ID, conversation);
        }
        headers
            .user_headers
            .insert(CORRELATION_ID, parent_id.to_string());
        for (name, value) in message.user_headers.iter() {
            headers.user_headers.insert(name, value);
        }

        let body = self
            .serializer
            .encode(&message.body)
            .map_err(|e| SerializationError::serialize(message.message_class, e))?;

        Ok((
            message.destination,
            NewMessage {
                message_id: Uuid::new_v4(),
                priority: message.priority,
                not_before: message.not_before.unwrap_or(now),
                enqueued: now,
                headers: self.serializer.serialize_headers(&headers)?,
                body,
            },
        ))
    }

    async fn guarded<T, Fut>(&self, action: Fut) -> Result<T, BusError>
    where
        Fut: Future<Output = StoreResult<T>>,
    {
        self.breaker
            .call_classified(|| action, StoreError::is_unavailable)
            .await
            .map_err(BusError::from)
    }
}

impl std::fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("target", &self.target)
            .field("pipeline", &self.pipeline)
            .field("has_failed_handler", &self.failed_handler.is_some())
            .finish()
    }
}

struct Written {
    outcome: ProcessOutcome,
    failure: Option<FailedMessage>,
}

impl Written {
    fn outcome(outcome: ProcessOutcome) -> Self {
        Self {
            outcome,
            failure: None,
        }
    }
}

/// `now + delay`, saturating at the latest representable time
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
