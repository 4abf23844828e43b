//! # PostgreSQL Store
//!
//! Runtime-built queries against the per-queue, per-topic and per-saga tables.
//! Table names are derived from validated names and always quoted.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED`, so concurrent workers (in this or
//! other processes) never receive the same row. The saga lock is a
//! conditional `UPDATE ... RETURNING` on the `blocked`/`blocked_at` columns and
//! commits immediately, independent of the message transaction.

use super::{MessageStore, MessageTarget, SagaLock, StoreError, StoreResult, UnitOfWork};
use crate::config::DatabaseConfig;
use crate::constants::tables;
use crate::messaging::{
    ClaimedMessage, MessageState, NewMessage, QueueMessageRecord, SubscribedMessageRecord,
};
use crate::saga::{NewSagaRow, SagaKey, SagaRecord};
use crate::validation::{QueueName, SagaName, SubscriberName, TopicName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

const MESSAGE_COLUMNS: &str =
    "id, message_id, priority, not_before, enqueued, completed, failed, retries, headers, body";
const SUBSCRIBED_COLUMNS: &str = "subscriber_id, valid_until";
const SAGA_COLUMNS: &str = "id, saga_id, \"key\", data, metadata, blocked, blocked_at";

fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

/// Resolved table names for one message target
struct TargetTables {
    pending: String,
    completed: String,
    failed: String,
    subscriber: Option<String>,
}

impl TargetTables {
    fn for_target(target: &MessageTarget) -> StoreResult<Self> {
        let (prefix, subscriber) = match target {
            MessageTarget::Queue(queue) => (queue.value()?.to_string(), None),
            MessageTarget::Subscriber { topic, subscriber } => (
                format!("{}{}", topic.value()?, tables::SUBSCRIBED_INFIX),
                Some(subscriber.value()?.to_string()),
            ),
        };
        Ok(Self {
            pending: quoted(&format!("{prefix}{}", tables::PENDING_SUFFIX)),
            completed: quoted(&format!("{prefix}{}", tables::COMPLETED_SUFFIX)),
            failed: quoted(&format!("{prefix}{}", tables::FAILED_SUFFIX)),
            subscriber,
        })
    }

    fn table(&self, state: MessageState) -> &str {
        match state {
            MessageState::Pending => &self.pending,
            MessageState::Completed => &self.completed,
            MessageState::Failed => &self.failed,
        }
    }

    fn columns(&self) -> String {
        match self.subscriber {
            Some(_) => format!("{MESSAGE_COLUMNS}, {SUBSCRIBED_COLUMNS}"),
            None => MESSAGE_COLUMNS.to_string(),
        }
    }

    /// `AND subscriber_id = $n` when the target is a subscriber
    fn subscriber_filter(&self, placeholder: usize) -> String {
        match self.subscriber {
            Some(_) => format!(" AND subscriber_id = ${placeholder}"),
            None => String::new(),
        }
    }

    /// Move a pending row into `destination`, overriding the terminal columns
    fn move_sql(&self, destination: MessageState) -> String {
        let extra = match self.subscriber {
            Some(_) => format!(", {SUBSCRIBED_COLUMNS}"),
            None => String::new(),
        };
        let (completed, failed, headers) = match destination {
            MessageState::Completed => ("$2", "NULL", "headers"),
            _ => ("NULL", "$2", "$3"),
        };
        format!(
            "WITH moved AS (DELETE FROM {pending} WHERE id = $1 RETURNING *) \
             INSERT INTO {table} ({MESSAGE_COLUMNS}{extra}) \
             SELECT id, message_id, priority, not_before, enqueued, {completed}, {failed}, \
             retries, {headers}, body{extra} FROM moved",
            pending = self.pending,
            table = self.table(destination),
        )
    }
}

fn queue_tables(queue: &QueueName) -> StoreResult<TargetTables> {
    TargetTables::for_target(&MessageTarget::Queue(queue.clone()))
}

fn subscribed_pending_table(topic: &TopicName) -> StoreResult<String> {
    Ok(quoted(&format!(
        "{}{}{}",
        topic.value()?,
        tables::SUBSCRIBED_INFIX,
        tables::PENDING_SUFFIX
    )))
}

fn saga_table(saga: &SagaName) -> StoreResult<String> {
    Ok(quoted(&format!("{}{}", saga.value()?, tables::SAGA_DATA_SUFFIX)))
}

fn store_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        let mapped = StoreError::from_sqlx(operation, e);
        error!(operation = operation, error = %mapped, "Store operation failed");
        mapped
    }
}

async fn insert_message(
    conn: &mut PgConnection,
    queue: &QueueName,
    message: &NewMessage,
) -> StoreResult<i64> {
    let sql = format!(
        "INSERT INTO {} (message_id, priority, not_before, enqueued, retries, headers, body) \
         VALUES ($1, $2, $3, $4, 0, $5, $6) RETURNING id",
        queue_tables(queue)?.pending
    );
    let (id,): (i64,) = sqlx::query_as(&sql)
        .bind(message.message_id)
        .bind(message.priority)
        .bind(message.not_before)
        .bind(message.enqueued)
        .bind(&message.headers)
        .bind(&message.body)
        .fetch_one(conn)
        .await
        .map_err(store_err("enqueue"))?;
    Ok(id)
}

async fn insert_published(
    conn: &mut PgConnection,
    topic: &TopicName,
    message: &NewMessage,
    valid_until: DateTime<Utc>,
) -> StoreResult<u64> {
    let sql = format!(
        "INSERT INTO {table} (message_id, priority, not_before, enqueued, retries, headers, body, \
         subscriber_id, valid_until) \
         SELECT $1, $2, $3, $4, 0, $5, $6, s.subscriber_id, $7 \
         FROM {subscriptions} s WHERE s.topic = $8 AND s.active",
        table = subscribed_pending_table(topic)?,
        subscriptions = tables::SUBSCRIPTIONS_TABLE,
    );
    let result = sqlx::query(&sql)
        .bind(message.message_id)
        .bind(message.priority)
        .bind(message.not_before)
        .bind(message.enqueued)
        .bind(&message.headers)
        .bind(&message.body)
        .bind(valid_until)
        .bind(topic.value()?)
        .execute(conn)
        .await
        .map_err(store_err("publish"))?;
    Ok(result.rows_affected())
}

/// Matches a saga row only while the caller's lock is still in place
const LOCK_FENCE: &str = "id = $1 AND blocked AND blocked_at = $2";

async fn unlock_saga(
    conn: &mut PgConnection,
    saga: &SagaName,
    record_id: i64,
    locked_at: DateTime<Utc>,
) -> StoreResult<u64> {
    let sql = format!(
        "UPDATE {} SET blocked = FALSE, blocked_at = NULL WHERE {LOCK_FENCE}",
        saga_table(saga)?
    );
    let result = sqlx::query(&sql)
        .bind(record_id)
        .bind(locked_at)
        .execute(conn)
        .await
        .map_err(store_err("release_saga_lock"))?;
    Ok(result.rows_affected())
}

async fn remove_saga(
    conn: &mut PgConnection,
    saga: &SagaName,
    record_id: i64,
    locked_at: DateTime<Utc>,
) -> StoreResult<u64> {
    let sql = format!("DELETE FROM {} WHERE {LOCK_FENCE}", saga_table(saga)?);
    let result = sqlx::query(&sql)
        .bind(record_id)
        .bind(locked_at)
        .execute(conn)
        .await
        .map_err(store_err("delete_saga"))?;
    Ok(result.rows_affected())
}

/// PostgreSQL-backed store
#[derive(Debug, Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await
            .map_err(store_err("connect"))?;

        info!(
            max_connections = config.max_connections,
            "✅ Connected message store to PostgreSQL"
        );
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn connection(&self) -> StoreResult<sqlx::pool::PoolConnection<Postgres>> {
        self.pool.acquire().await.map_err(store_err("acquire"))
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.map_err(store_err("begin"))?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    #[instrument(skip(self, message), fields(queue = %queue))]
    async fn enqueue(&self, queue: &QueueName, message: NewMessage) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        insert_message(&mut conn, queue, &message).await
    }

    #[instrument(skip(self, message), fields(topic = %topic))]
    async fn publish(
        &self,
        topic: &TopicName,
        message: NewMessage,
        valid_until: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        insert_published(&mut conn, topic, &message, valid_until).await
    }

    async fn subscribe(&self, topic: &TopicName, subscriber: &SubscriberName) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {} (topic, subscriber_id, active, updated_at) VALUES ($1, $2, TRUE, $3) \
             ON CONFLICT (topic, subscriber_id) DO UPDATE SET active = TRUE, updated_at = EXCLUDED.updated_at",
            tables::SUBSCRIPTIONS_TABLE
        );
        sqlx::query(&sql)
            .bind(topic.value()?)
            .bind(subscriber.value()?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(store_err("subscribe"))?;
        debug!(topic = %topic, subscriber = %subscriber, "Subscription activated");
        Ok(())
    }

    async fn unsubscribe(
        &self,
        topic: &TopicName,
        subscriber: &SubscriberName,
    ) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {} SET active = FALSE, updated_at = $3 \
             WHERE topic = $1 AND subscriber_id = $2 AND active",
            tables::SUBSCRIPTIONS_TABLE
        );
        let result = sqlx::query(&sql)
            .bind(topic.value()?)
            .bind(subscriber.value()?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(store_err("unsubscribe"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_subscribers(&self, topic: &TopicName) -> StoreResult<Vec<SubscriberName>> {
        let sql = format!(
            "SELECT subscriber_id FROM {} WHERE topic = $1 AND active ORDER BY subscriber_id",
            tables::SUBSCRIPTIONS_TABLE
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(topic.value()?)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("active_subscribers"))?;
        rows.into_iter()
            .map(|(name,)| SubscriberName::new(name).map_err(StoreError::from))
            .collect()
    }

    #[instrument(skip(self, create), fields(saga = %saga, key = %key))]
    async fn acquire_saga_lock(
        &self,
        saga: &SagaName,
        key: &SagaKey,
        lease: Duration,
        create: Option<NewSagaRow>,
    ) -> StoreResult<SagaLock> {
        let table = saga_table(saga)?;
        let now = Utc::now();
        let lease_cutoff = now
            - chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::query("acquire_saga_lock", e.to_string()))?;

        let take = format!(
            "UPDATE {table} SET blocked = TRUE, \
             blocked_at = GREATEST($2, blocked_at + INTERVAL '1 microsecond') \
             WHERE \"key\" = $1 AND (blocked = FALSE OR blocked_at IS NULL OR blocked_at <= $3) \
             RETURNING {SAGA_COLUMNS}"
        );
        let taken: Option<SagaRecord> = sqlx::query_as(&take)
            .bind(key.as_str())
            .bind(now)
            .bind(lease_cutoff)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("acquire_saga_lock"))?;
        if let Some(record) = taken {
            return Ok(SagaLock::Acquired {
                record,
                created: false,
            });
        }

        let exists_sql = format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE \"key\" = $1)");
        let (exists,): (bool,) = sqlx::query_as(&exists_sql)
            .bind(key.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(store_err("acquire_saga_lock"))?;
        if exists {
            return Ok(SagaLock::Blocked);
        }

        let Some(new_row) = create else {
            return Ok(SagaLock::NotFound);
        };

        let insert = format!(
            "INSERT INTO {table} (saga_id, \"key\", data, metadata, blocked, blocked_at) \
             VALUES ($1, $2, $3, $4, TRUE, $5) ON CONFLICT (\"key\") DO NOTHING \
             RETURNING {SAGA_COLUMNS}"
        );
        let created: Option<SagaRecord> = sqlx::query_as(&insert)
            .bind(new_row.saga_id)
            .bind(key.as_str())
            .bind(&new_row.data)
            .bind(&new_row.metadata)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("acquire_saga_lock"))?;

        // A concurrent starter inserted the row first and holds its lock
        Ok(match created {
            Some(record) => SagaLock::Acquired {
                record,
                created: true,
            },
            None => SagaLock::Blocked,
        })
    }

    async fn release_saga_lock(
        &self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        if unlock_saga(&mut conn, saga, record_id, locked_at).await? == 0 {
            debug!(saga = %saga, record_id, "Saga lock already taken over, nothing to release");
        }
        Ok(())
    }

    async fn delete_saga(
        &self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        if remove_saga(&mut conn, saga, record_id, locked_at).await? == 0 {
            debug!(saga = %saga, record_id, "Saga lock already taken over, row kept");
        }
        Ok(())
    }

    async fn load_saga(&self, saga: &SagaName, key: &SagaKey) -> StoreResult<Option<SagaRecord>> {
        let sql = format!(
            "SELECT {SAGA_COLUMNS} FROM {} WHERE \"key\" = $1",
            saga_table(saga)?
        );
        sqlx::query_as(&sql)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("load_saga"))
    }

    async fn find_message(
        &self,
        target: &MessageTarget,
        message_id: Uuid,
    ) -> StoreResult<Option<QueueMessageRecord>> {
        let tables = TargetTables::for_target(target)?;
        for state in [
            MessageState::Pending,
            MessageState::Completed,
            MessageState::Failed,
        ] {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM {} WHERE message_id = $1{}",
                tables.table(state),
                tables.subscriber_filter(2)
            );
            let mut query = sqlx::query_as::<_, QueueMessageRecord>(&sql).bind(message_id);
            if let Some(subscriber) = &tables.subscriber {
                query = query.bind(subscriber);
            }
            let found = query
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err("find_message"))?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    async fn count_messages(&self, target: &MessageTarget, state: MessageState) -> StoreResult<u64> {
        let tables = TargetTables::for_target(target)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE TRUE{}",
            tables.table(state),
            tables.subscriber_filter(1)
        );
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        if let Some(subscriber) = &tables.subscriber {
            query = query.bind(subscriber);
        }
        let (count,) = query
            .fetch_one(&self.pool)
            .await
            .map_err(store_err("count_messages"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

/// One PostgreSQL transaction
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    #[instrument(skip(self), fields(target = %target))]
    async fn claim_next(
        &mut self,
        target: &MessageTarget,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ClaimedMessage>> {
        let tables = TargetTables::for_target(target)?;
        let expiry = if tables.subscriber.is_some() {
            " AND valid_until >= $1"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {columns} FROM {pending} \
             WHERE not_before <= $1 AND completed IS NULL AND failed IS NULL{expiry}{subscriber} \
             ORDER BY priority DESC, id ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
            columns = tables.columns(),
            pending = tables.pending,
            subscriber = tables.subscriber_filter(2),
        );

        match &tables.subscriber {
            None => {
                let row: Option<QueueMessageRecord> = sqlx::query_as(&sql)
                    .bind(now)
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(store_err("claim_next"))?;
                Ok(row.map(ClaimedMessage::Queue))
            }
            Some(subscriber) => {
                let row: Option<SubscribedMessageRecord> = sqlx::query_as(&sql)
                    .bind(now)
                    .bind(subscriber)
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(store_err("claim_next"))?;
                Ok(row.map(ClaimedMessage::Subscribed))
            }
        }
    }

    async fn complete(
        &mut self,
        target: &MessageTarget,
        record_id: i64,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let sql = TargetTables::for_target(target)?.move_sql(MessageState::Completed);
        sqlx::query(&sql)
            .bind(record_id)
            .bind(completed_at)
            .execute(&mut *self.tx)
            .await
            .map_err(store_err("complete"))?;
        Ok(())
    }

    async fn fail(
        &mut self,
        target: &MessageTarget,
        record_id: i64,
        failed_at: DateTime<Utc>,
        headers: String,
    ) -> StoreResult<()> {
        let sql = TargetTables::for_target(target)?.move_sql(MessageState::Failed);
        sqlx::query(&sql)
            .bind(record_id)
            .bind(failed_at)
            .bind(headers)
            .execute(&mut *self.tx)
            .await
            .map_err(store_err("fail"))?;
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
        let sql = format!(
            "UPDATE {} SET not_before = $2, retries = $3, headers = COALESCE($4, headers) WHERE id = $1",
            TargetTables::for_target(target)?.pending
        );
        sqlx::query(&sql)
            .bind(record_id)
            .bind(not_before)
            .bind(retries)
            .bind(headers)
            .execute(&mut *self.tx)
            .await
            .map_err(store_err("reschedule"))?;
        Ok(())
    }

    async fn enqueue(&mut self, queue: &QueueName, message: NewMessage) -> StoreResult<i64> {
        insert_message(&mut self.tx, queue, &message).await
    }

    async fn publish(
        &mut self,
        topic: &TopicName,
        message: NewMessage,
        valid_until: DateTime<Utc>,
    ) -> StoreResult<u64> {
        insert_published(&mut self.tx, topic, &message, valid_until).await
    }

    async fn save_saga(
        &mut self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
        data: String,
        metadata: String,
    ) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET data = $3, metadata = $4, blocked = FALSE, blocked_at = NULL \
             WHERE {LOCK_FENCE}",
            saga_table(saga)?
        );
        let result = sqlx::query(&sql)
            .bind(record_id)
            .bind(locked_at)
            .bind(data)
            .bind(metadata)
            .execute(&mut *self.tx)
            .await
            .map_err(store_err("save_saga"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::saga_lock_lost(saga, record_id));
        }
        Ok(())
    }

    async fn delete_saga(
        &mut self,
        saga: &SagaName,
        record_id: i64,
        locked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if remove_saga(&mut self.tx, saga, record_id, locked_at).await? == 0 {
            return Err(StoreError::saga_lock_lost(saga, record_id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(store_err("commit"))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.map_err(store_err("rollback"))
    }
}
