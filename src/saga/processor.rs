//! Saga lock lifecycle around one dispatch.

use super::{NewSagaRow, SagaDispatch, SagaMapperCache, SagaMetadata};
use crate::error::HandlerError;
use crate::logging::log_saga_operation;
use crate::pipeline::{HeldSagaLock, MessageContext, SagaWrite};
use crate::resilience::{CircuitBreaker, CircuitBreakerError};
use crate::serialization::{Serializer, SerializerExt};
use crate::store::{MessageStore, SagaLock, StoreError, StoreResult};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

/// Locks, loads or creates saga instances and records their persistence for
/// the message's unit of work
pub struct SagaProcessor {
    store: Arc<dyn MessageStore>,
    breaker: Arc<CircuitBreaker>,
    serializer: Arc<dyn Serializer>,
    mappers: SagaMapperCache,
    lock_lease: Duration,
}

impl SagaProcessor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        breaker: Arc<CircuitBreaker>,
        serializer: Arc<dyn Serializer>,
        lock_lease: Duration,
    ) -> Self {
        Self {
            store,
            breaker,
            serializer,
            mappers: SagaMapperCache::new(),
            lock_lease,
        }
    }

    pub fn mappers(&self) -> &SagaMapperCache {
        &self.mappers
    }

    /// Run one saga for the current message. On success the saga's save or
    /// delete is queued on `ctx`; the lock stays held until the caller commits
    /// or calls [`SagaProcessor::release`].
    pub(crate) async fn process(
        &self,
        dispatch: &dyn SagaDispatch,
        ctx: &mut MessageContext,
    ) -> Result<(), HandlerError> {
        let saga = dispatch.saga_name().clone();
        let key = dispatch.correlate(&self.mappers, ctx)?;
        let now = Utc::now();

        let create = if dispatch.starts() {
            Some(NewSagaRow {
                saga_id: Uuid::new_v4(),
                data: dispatch.initial_data(self.serializer.as_ref())?,
                metadata: self.serializer.serialize(&SagaMetadata::started_at(now))?,
            })
        } else {
            None
        };

        let lock = self
            .guarded(
                "acquire_saga_lock",
                self.store
                    .acquire_saga_lock(&saga, &key, self.lock_lease, create),
            )
            .await?;

        let (record, created) = match lock {
            SagaLock::Acquired { record, created } => (record, created),
            SagaLock::Blocked => {
                debug!(saga = %saga, key = %key, "🔒 Saga instance locked, deferring message");
                return Err(HandlerError::SagaLocked {
                    saga: saga.to_string(),
                    key: key.to_string(),
                });
            }
            SagaLock::NotFound => {
                return Err(HandlerError::SagaNotStarted {
                    saga: saga.to_string(),
                    key: key.to_string(),
                });
            }
        };

        let Some(locked_at) = record.blocked_at else {
            return Err(HandlerError::Store(StoreError::query(
                "acquire_saga_lock",
                format!("saga {saga} row {} acquired without a lock time", record.id),
            )));
        };
        ctx.hold_saga_lock(HeldSagaLock {
            saga: saga.clone(),
            record_id: record.id,
            locked_at,
            created,
        });
        log_saga_operation(
            if created { "started" } else { "locked" },
            saga.to_string().as_str(),
            key.as_str(),
            Some(record.saga_id),
        );

        let metadata: SagaMetadata = self.serializer.deserialize(&record.metadata)?;
        let outcome = dispatch
            .invoke(
                ctx,
                key.clone(),
                &record,
                metadata,
                created,
                self.serializer.as_ref(),
            )
            .await?;

        let complete = outcome.complete;
        let write = if complete {
            SagaWrite::Delete {
                saga,
                record_id: record.id,
                locked_at,
            }
        } else {
            SagaWrite::Save {
                saga,
                record_id: record.id,
                locked_at,
                data: outcome.data,
                metadata: self.serializer.serialize(&SagaMetadata {
                    started: metadata.started,
                    last_message_time: now,
                })?,
            }
        };
        debug!(
            key = %key,
            complete,
            "Saga dispatch recorded"
        );
        ctx.record_saga_write(write);
        Ok(())
    }

    /// Undo locks held by a dispatch that will not commit: rows created by it
    /// are deleted, others are unlocked with their data untouched
    pub(crate) async fn release(&self, locks: Vec<HeldSagaLock>) {
        for lock in locks {
            let result = if lock.created {
                self.guarded(
                    "delete_saga",
                    self.store
                        .delete_saga(&lock.saga, lock.record_id, lock.locked_at),
                )
                .await
            } else {
                self.guarded(
                    "release_saga_lock",
                    self.store
                        .release_saga_lock(&lock.saga, lock.record_id, lock.locked_at),
                )
                .await
            };

            if let Err(e) = result {
                // the lease lets another message take the row over later
                error!(
                    saga = %lock.saga,
                    record_id = lock.record_id,
                    error = %e,
                    "❌ Failed to release saga lock"
                );
            }
        }
    }

    async fn guarded<T, Fut>(&self, operation: &'static str, action: Fut) -> Result<T, HandlerError>
    where
        Fut: Future<Output = StoreResult<T>>,
    {
        self.breaker
            .call_classified(|| action, StoreError::is_unavailable)
            .await
            .map_err(|e| match e {
                CircuitBreakerError::CircuitOpen {
                    component,
                    retry_after,
                } => {
                    debug!(operation, component = %component, "Saga store breaker open");
                    HandlerError::CircuitOpen {
                        component,
                        retry_after,
                    }
                }
                CircuitBreakerError::OperationFailed(e) => HandlerError::Store(e),
            })
    }
}

impl std::fmt::Debug for SagaProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaProcessor")
            .field("breaker", &self.breaker.name())
            .field("lock_lease", &self.lock_lease)
            .field("configured_sagas", &self.mappers.len())
            .finish()
    }
}
