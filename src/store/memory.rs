//! # In-Memory Store
//!
//! Implements the store traits over process memory for tests and embedded use.
//! Row locks emulate `FOR UPDATE SKIP LOCKED`: a claimed row stays invisible to
//! other units of work until its owner commits, rolls back or is dropped.
//! Unit-of-work writes are buffered and applied atomically on commit.
//!
//! [`MemoryMessageStore::set_unavailable`] simulates an outage: every call fails
//! with [`StoreError::Unavailable`] until it is cleared.

use super::{MessageStore, MessageTarget, SagaLock, StoreError, StoreResult, UnitOfWork};
use crate::messaging::{
    ClaimedMessage, MessageState, NewMessage, QueueMessageRecord, SubscribedMessageRecord,
};
use crate::saga::{NewSagaRow, SagaKey, SagaRecord};
use crate::validation::{QueueName, SagaName, SubscriberName, TopicName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MessageTables {
    pending: BTreeMap<i64, ClaimedMessage>,
    completed: Vec<ClaimedMessage>,
    failed: Vec<ClaimedMessage>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_message_id: i64,
    next_saga_id: i64,
    tables: HashMap<MessageTarget, MessageTables>,
    subscriptions: HashMap<TopicName, BTreeMap<SubscriberName, bool>>,
    sagas: HashMap<SagaName, HashMap<String, SagaRecord>>,
    locked: HashSet<(MessageTarget, i64)>,
    unavailable: bool,
}

impl MemoryState {
    fn check(&self, operation: &str) -> StoreResult<()> {
        if self.unavailable {
            return Err(StoreError::unavailable(operation, "in-memory store marked unavailable"));
        }
        Ok(())
    }

    fn allocate_message_id(&mut self) -> i64 {
        self.next_message_id += 1;
        self.next_message_id
    }

    fn active_subscribers(&self, topic: &TopicName) -> Vec<SubscriberName> {
        self.subscriptions
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|(_, active)| **active)
                    .map(|(subscriber, _)| subscriber.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rows for a publish, one per active subscriber
    fn fan_out(
        &mut self,
        topic: &TopicName,
        message: &NewMessage,
        valid_until: DateTime<Utc>,
    ) -> StoreResult<Vec<(MessageTarget, ClaimedMessage)>> {
        let mut rows = Vec::new();
        for subscriber in self.active_subscribers(topic) {
            let id = self.allocate_message_id();
            let row = ClaimedMessage::Subscribed(SubscribedMessageRecord {
                message: message.clone().into_record(id),
                subscriber_id: subscriber.value()?.to_string(),
                valid_until,
            });
            rows.push((MessageTarget::subscriber(topic.clone(), subscriber), row));
        }
        Ok(rows)
    }

    fn insert(&mut self, target: MessageTarget, row: ClaimedMessage) {
        let id = row.record().id;
        self.tables.entry(target).or_default().pending.insert(id, row);
    }

    fn take_pending(&mut self, target: &MessageTarget, id: i64) -> StoreResult<ClaimedMessage> {
        self.tables
            .get_mut(target)
            .and_then(|tables| tables.pending.remove(&id))
            .ok_or_else(|| StoreError::not_found("pending message", id))
    }

    /// Row `id` while it is still locked at `locked_at`
    fn locked_saga_mut(
        &mut self,
        saga: &SagaName,
        id: i64,
        locked_at: DateTime<Utc>,
    ) -> Option<&mut SagaRecord> {
        self.sagas.get_mut(saga).and_then(|rows| {
            rows.values_mut()
                .find(|row| row.id == id && row.blocked && row.blocked_at == Some(locked_at))
        })
    }

    fn remove_locked_saga(&mut self, saga: &SagaName, id: i64, locked_at: DateTime<Utc>) -> bool {
        let Some(rows) = self.sagas.get_mut(saga) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|_, row| {
            !(row.id == id && row.blocked && row.blocked_at == Some(locked_at))
        });
        rows.len() < before
    }

    fn apply(&mut self, write: BufferedWrite) -> StoreResult<()> {
        match write {
            BufferedWrite::Complete { target, id, at } => {
                let mut row = self.take_pending(&target, id)?;
                row.record_mut().completed = Some(at);
                self.tables.entry(target).or_default().completed.push(row);
            }
            BufferedWrite::Fail {
                target,
                id,
                at,
                headers,
            } => {
                let mut row = self.take_pending(&target, id)?;
                let record = row.record_mut();
                record.failed = Some(at);
                record.headers = headers;
                self.tables.entry(target).or_default().failed.push(row);
            }
            BufferedWrite::Reschedule {
                target,
                id,
                not_before,
                retries,
                headers,
            } => {
                let row = self
                    .tables
                    .get_mut(&target)
                    .and_then(|tables| tables.pending.get_mut(&id))
                    .ok_or_else(|| StoreError::not_found("pending message", id))?;
                let record = row.record_mut();
                record.not_before = not_before;
                record.retries = retries;
                if let Some(headers) = headers {
                    record.headers = headers;
                }
            }
            BufferedWrite::Insert { target, row } => self.insert(target, row),
            BufferedWrite::SaveSaga {
                saga,
                id,
                locked_at,
                data,
                metadata,
            } => {
                let row = self
                    .locked_saga_mut(&saga, id, locked_at)
                    .ok_or_else(|| StoreError::saga_lock_lost(&saga, id))?;
                row.data = data;
                row.metadata = metadata;
                row.blocked = false;
                row.blocked_at = None;
            }
            BufferedWrite::DeleteSaga {
                saga,
                id,
                locked_at,
            } => {
                if !self.remove_locked_saga(&saga, id, locked_at) {
                    return Err(StoreError::saga_lock_lost(&saga, id));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
enum BufferedWrite {
    Complete {
        target: MessageTarget,
        id: i64,
        at: DateTime<Utc>,
    },
    Fail {
        target: MessageTarget,
        id: i64,
        at: DateTime<Utc>,
        headers: String,
    },
    Reschedule {
        target: MessageTarget,
        id: i64,
        not_before: DateTime<Utc>,
        retries: i16,
        headers: Option<String>,
    },
    Insert {
        target: MessageTarget,
        row: ClaimedMessage,
    },
    SaveSaga {
        saga: SagaName,
        id: i64,
        locked_at: DateTime<Utc>,
        data: String,
        metadata: String,
    },
    DeleteSaga {
        saga: SagaName,
        id: i64,
        locked_at: DateTime<Utc>,
    },
}

/// Process-local store
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the database were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Snapshot of the rows in one table
    pub fn rows(&self, target: &MessageTarget, state: MessageState) -> Vec<ClaimedMessage> {
        let guard = self.state.lock();
        let Some(tables) = guard.tables.get(target) else {
            return Vec::new();
        };
        match state {
            MessageState::Pending => tables.pending.values().cloned().collect(),
            MessageState::Completed => tables.completed.clone(),
            MessageState::Failed => tables.failed.clone(),
        }
    }
}

/// Lock tokens of one row strictly increase, even within one clock tick
fn next_lock_token(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(previous) if previous >= now => previous + chrono::Duration::microseconds(1),
        _ => now,
    }
}

fn lease_expired(blocked_at: Option<DateTime<Utc>>, now: DateTime<Utc>, lease: Duration) -> bool {
    match blocked_at {
        None => true,
        Some(at) => (now - at).to_std().is_ok_and(|held| held >= lease),
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        self.state.lock().check("begin")?;
        Ok(Box::new(MemoryUnitOfWork {
            state: Arc::clone(&self.state),
            writes: Vec::new(),
            claimed: Vec::new(),
            finished: false,
        }))
    }

    async fn enqueue(&self, queue: &QueueName, message: NewMessage) -> StoreResult<i64> {
        let mut state = self.state.lock();
        state.check("enqueue")?;
        let id = state.allocate_message_id();
        state.insert(
            MessageTarget::Queue(queue.clone()),
            ClaimedMessage::Queue(message.into_record(id)),
        );
        Ok(id)
    }

    async fn publish(
        &self,
        topic: &TopicName,
        message: NewMessage,
        valid_until: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock();
        state.check("publish")?;
        let rows = state.fan_out(topic, &message, valid_until)?;
        let count = rows.len() as u64;
        for (target, row) in rows {
            state.insert(target, row);
        }
        Ok(count)
    }

    async fn subscribe(&self, topic: &TopicName, subscriber: &SubscriberName) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.check("subscribe")?;
        state
            .subscriptions
            .entry(topic.clone())
            .or_default()
            .insert(subscriber.clone(), true);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        topic: &TopicName,
        subscriber: &SubscriberName,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.check("unsubscribe")?;
        let was_active = state
            .subscriptions
            .get_mut(topic)
            .and_then(|subscribers| subscribers.get_mut(subscriber))
            .map(|active| std::mem::replace(active, false))
            .unwrap_or(false);
        Ok(was_active)
    }

    async fn active_subscribers(&self, topic: &TopicName) -> StoreResult<Vec<SubscriberName>> {
        let state = self.state.lock();
        state.check("active_subscribers")?;
        Ok(state.active_subscribers(topic))
    }

    async fn acquire_saga_lock(
        &self,
        saga: &SagaName,
        key: &SagaKey,
        lease: Duration,
        create: Option<NewSagaRow>,
    ) -> StoreResult<SagaLock> {
        let mut state = self.state.lock();
        state.check("acquire_saga_lock")?;
        let now = Utc::now();

        if let Some(row) = state
            .sagas
            .get_mut(saga)
            .and_then(|rows| rows.get_mut(key.as_str()))
        {
            if row.blocked && !lease_expired(row.blocked_at, now, lease) {
                return Ok(SagaLock::Blocked);
            }
            if row.blocked {
                debug!(saga = %saga, key = %key, "Taking over saga lock with expired lease");
            }
            row.blocked = true;
            row.blocked_at = Some(next_lock_token(row.blocked_at, now));
            return Ok(SagaLock::Acquired {
                record: row.clone(),
                created: false,
            });
        }

        let Some(new_row) = create else {
            return Ok(SagaLock::NotFound);
        };

        state.next_saga_id += 1;
        let record = SagaRecord {
            id: state.next_saga_id,
            saga_id: new_row.saga_id,
            key: key.as_str().to_string(),
            data: new_row.data,
            metadata: new_row.metadata,
            blocked: true,
            blocked_at: Some(now),
        };
        state
            .sagas
            .entry(saga.clone())
            .or_default()
            .insert(record.key.clone(), record.clone());
        Ok(SagaLock::Acquired {
            record,
            created: true,
        })
    }

    async fn release_saga_lock(
        &self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.check("release_saga_lock")?;
        match state.locked_saga_mut(saga, record_id, locked_at) {
            Some(row) => {
                row.blocked = false;
                row.blocked_at = None;
            }
            None => debug!(saga = %saga, record_id, "Saga lock already taken over, nothing to release"),
        }
        Ok(())
    }

    async fn delete_saga(
        &self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.check("delete_saga")?;
        if !state.remove_locked_saga(saga, record_id, locked_at) {
            debug!(saga = %saga, record_id, "Saga lock already taken over, row kept");
        }
        Ok(())
    }

    async fn load_saga(&self, saga: &SagaName, key: &SagaKey) -> StoreResult<Option<SagaRecord>> {
        let state = self.state.lock();
        state.check("load_saga")?;
        Ok(state
            .sagas
            .get(saga)
            .and_then(|rows| rows.get(key.as_str()))
            .cloned())
    }

    async fn find_message(
        &self,
        target: &MessageTarget,
        message_id: Uuid,
    ) -> StoreResult<Option<QueueMessageRecord>> {
        let state = self.state.lock();
        state.check("find_message")?;
        let Some(tables) = state.tables.get(target) else {
            return Ok(None);
        };
        Ok(tables
            .pending
            .values()
            .chain(tables.completed.iter())
            .chain(tables.failed.iter())
            .map(ClaimedMessage::record)
            .find(|record| record.message_id == message_id)
            .cloned())
    }

    async fn count_messages(&self, target: &MessageTarget, state: MessageState) -> StoreResult<u64> {
        let guard = self.state.lock();
        guard.check("count_messages")?;
        let count = guard.tables.get(target).map_or(0, |tables| match state {
            MessageState::Pending => tables.pending.len(),
            MessageState::Completed => tables.completed.len(),
            MessageState::Failed => tables.failed.len(),
        });
        Ok(count as u64)
    }
}

/// Buffered transaction over [`MemoryMessageStore`]
#[derive(Debug)]
pub struct MemoryUnitOfWork {
    state: Arc<Mutex<MemoryState>>,
    writes: Vec<BufferedWrite>,
    claimed: Vec<(MessageTarget, i64)>,
    finished: bool,
}

impl MemoryUnitOfWork {
    fn release_locks(&mut self) {
        if self.claimed.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for claim in self.claimed.drain(..) {
            state.locked.remove(&claim);
        }
    }

    fn owns(&self, target: &MessageTarget, id: i64) -> StoreResult<()> {
        if self
            .claimed
            .iter()
            .any(|(claimed_target, claimed_id)| claimed_target == target && *claimed_id == id)
        {
            Ok(())
        } else {
            Err(StoreError::not_found("claimed message", id))
        }
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        if !self.finished {
            self.release_locks();
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn claim_next(
        &mut self,
        target: &MessageTarget,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ClaimedMessage>> {
        let mut state = self.state.lock();
        state.check("claim_next")?;

        let claimed = state.tables.get(target).and_then(|tables| {
            tables
                .pending
                .values()
                .filter(|row| row.is_eligible(now))
                .filter(|row| !state.locked.contains(&(target.clone(), row.record().id)))
                .min_by_key(|row| (Reverse(row.record().priority), row.record().id))
                .cloned()
        });

        if let Some(row) = &claimed {
            let claim = (target.clone(), row.record().id);
            state.locked.insert(claim.clone());
            self.claimed.push(claim);
        }
        Ok(claimed)
    }

    async fn complete(
        &mut self,
        target: &MessageTarget,
        record_id: i64,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.owns(target, record_id)?;
        self.writes.push(BufferedWrite::Complete {
            target: target.clone(),
            id: record_id,
            at: completed_at,
        });
        Ok(())
    }

    async fn fail(
        &mut self,
        target: &MessageTarget,
        record_id: i64,
        failed_at: DateTime<Utc>,
        headers: String,
    ) -> StoreResult<()> {
        self.owns(target, record_id)?;
        self.writes.push(BufferedWrite::Fail {
            target: target.clone(),
            id: record_id,
            at: failed_at,
            headers,
        });
        Ok(())
    }

    async fn reschedule(
        &mut self,
        target: &MessageTarget,
        record_id: i64,
        not_before: DateTime<Utc>,
        retries: i16,
        headers: Option<String>,
    ) -> StoreResult<()> {
        self.owns(target, record_id)?;
        self.writes.push(BufferedWrite::Reschedule {
            target: target.clone(),
            id: record_id,
            not_before,
            retries,
            headers,
        });
        Ok(())
    }

    async fn enqueue(&mut self, queue: &QueueName, message: NewMessage) -> StoreResult<i64> {
        let id = {
            let mut state = self.state.lock();
            state.check("enqueue")?;
            state.allocate_message_id()
        };
        self.writes.push(BufferedWrite::Insert {
            target: MessageTarget::Queue(queue.clone()),
            row: ClaimedMessage::Queue(message.into_record(id)),
        });
        Ok(id)
    }

    async fn publish(
        &mut self,
        topic: &TopicName,
        message: NewMessage,
        valid_until: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let rows = {
            let mut state = self.state.lock();
            state.check("publish")?;
            state.fan_out(topic, &message, valid_until)?
        };
        let count = rows.len() as u64;
        self.writes.extend(
            rows.into_iter()
                .map(|(target, row)| BufferedWrite::Insert { target, row }),
        );
        Ok(count)
    }

    async fn save_saga(
        &mut self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
        data: String,
        metadata: String,
    ) -> StoreResult<()> {
        self.writes.push(BufferedWrite::SaveSaga {
            saga: saga.clone(),
            id: record_id,
            locked_at,
            data,
            metadata,
        });
        Ok(())
    }

    async fn delete_saga(
        &mut self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.writes.push(BufferedWrite::DeleteSaga {
            saga: saga.clone(),
            id: record_id,
            locked_at,
        });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        {
            let mut state = self.state.lock();
            state.check("commit")?;

            let mut next = state.clone();
            for write in self.writes.drain(..) {
                next.apply(write)?;
            }
            *state = next;
        }
        self.release_locks();
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.writes.clear();
        self.release_locks();
        self.finished = true;
        Ok(())
    }
}
