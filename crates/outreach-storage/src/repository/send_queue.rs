//! Send queue repository

use crate::db::{db_err, DatabasePool};
use crate::models::{EnqueueOutcome, NewQueueItem, SendQueueItem};
use crate::repository::messages::{absorb_locked, lock_message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_common::types::{normalize_email, MessageId, QueueItemId};
use outreach_common::{Error, Result, Signal};
use tracing::{debug, info};
use uuid::Uuid;

/// Send queue repository trait
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Queue a message for sending.
    ///
    /// Idempotent per message: while an item for the message is pending or
    /// processing, that item is returned and nothing new is created. The
    /// message moves to `queued` in the same transaction.
    async fn enqueue(&self, input: NewQueueItem, at: DateTime<Utc>) -> Result<EnqueueOutcome>;

    async fn get(&self, id: QueueItemId) -> Result<Option<SendQueueItem>>;
    async fn list_for_message(&self, message_id: MessageId) -> Result<Vec<SendQueueItem>>;

    /// Pending items due at `now`, highest priority first, then oldest
    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<SendQueueItem>>;

    /// Move a pending item to processing. `None` if another worker got it.
    async fn claim(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<Option<SendQueueItem>>;

    /// Return a claimed item to pending without spending an attempt
    async fn defer(&self, id: QueueItemId, until: DateTime<Utc>, now: DateTime<Utc>) -> Result<()>;

    async fn mark_sent(&self, id: QueueItemId, attempts: i32, now: DateTime<Utc>) -> Result<()>;

    async fn schedule_retry(
        &self,
        id: QueueItemId,
        attempts: i32,
        error: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_failed(
        &self,
        id: QueueItemId,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Cancel a pending item. Returns false if it was claimed or had already concluded.
    async fn cancel(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool>;

    /// Conclude a claimed item as cancelled without sending it
    async fn abandon(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<()>;

    /// Cancel every pending item addressed to `email` and withdraw the messages.
    ///
    /// Returns the ids of the affected messages.
    async fn cancel_pending_for_recipient(
        &self,
        email: &str,
        except_message: Option<MessageId>,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>>;

    /// Return processing items claimed before `claimed_before` to pending
    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Database send queue repository
pub struct DbQueueRepository {
    pool: DatabasePool,
}

impl DbQueueRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    fn expect_updated(result: sqlx::postgres::PgQueryResult, id: QueueItemId) -> Result<()> {
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Queue item {} not found or not processing",
                id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for DbQueueRepository {
    async fn enqueue(&self, input: NewQueueItem, at: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        // Lock the message first so concurrent enqueues serialize on it
        let message = lock_message(&mut tx, input.message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Message {} not found", input.message_id)))?;

        let existing = sqlx::query_as::<_, SendQueueItem>(
            r#"
            SELECT * FROM send_queue
            WHERE message_id = $1 AND status IN ('pending', 'processing')
            LIMIT 1
            "#,
        )
        .bind(input.message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(item) = existing {
            tx.rollback().await.map_err(db_err)?;
            debug!(message_id = %input.message_id, queue_item_id = %item.id, "Message already queued");
            return Ok(EnqueueOutcome {
                item,
                created: false,
            });
        }

        let item = sqlx::query_as::<_, SendQueueItem>(
            r#"
            INSERT INTO send_queue (
                id, message_id, account_id, scheduled_for, priority,
                attempts, max_attempts, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, 'pending', $7, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.message_id)
        .bind(&input.account_id)
        .bind(input.scheduled_for)
        .bind(input.priority)
        .bind(input.max_attempts)
        .bind(at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        absorb_locked(&mut tx, message, Signal::Queued, at).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(EnqueueOutcome {
            item,
            created: true,
        })
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<SendQueueItem>> {
        sqlx::query_as::<_, SendQueueItem>("SELECT * FROM send_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_for_message(&self, message_id: MessageId) -> Result<Vec<SendQueueItem>> {
        sqlx::query_as::<_, SendQueueItem>(
            "SELECT * FROM send_queue WHERE message_id = $1 ORDER BY created_at ASC",
        )
        .bind(message_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<SendQueueItem>> {
        sqlx::query_as::<_, SendQueueItem>(
            r#"
            SELECT * FROM send_queue
            WHERE status = 'pending' AND scheduled_for <= $1
            ORDER BY priority DESC, scheduled_for ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn claim(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<Option<SendQueueItem>> {
        sqlx::query_as::<_, SendQueueItem>(
            r#"
            UPDATE send_queue
            SET status = 'processing', claimed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn defer(&self, id: QueueItemId, until: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE send_queue
            SET status = 'pending', scheduled_for = $2, claimed_at = NULL, updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(until)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Self::expect_updated(result, id)
    }

    async fn mark_sent(&self, id: QueueItemId, attempts: i32, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE send_queue
            SET status = 'sent', attempts = $2, last_error = NULL, claimed_at = NULL, updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Self::expect_updated(result, id)
    }

    async fn schedule_retry(
        &self,
        id: QueueItemId,
        attempts: i32,
        error: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE send_queue
            SET status = 'pending', attempts = $2, last_error = $3,
                scheduled_for = $4, claimed_at = NULL, updated_at = $5
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(until)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Self::expect_updated(result, id)
    }

    async fn mark_failed(
        &self,
        id: QueueItemId,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE send_queue
            SET status = 'failed', attempts = $2, last_error = $3, claimed_at = NULL, updated_at = $4
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Self::expect_updated(result, id)
    }

    async fn cancel(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE send_queue
            SET status = 'cancelled', updated_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn abandon(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE send_queue
            SET status = 'cancelled', claimed_at = NULL, updated_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Self::expect_updated(result, id)
    }

    async fn cancel_pending_for_recipient(
        &self,
        email: &str,
        except_message: Option<MessageId>,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let cancelled: Vec<(MessageId,)> = sqlx::query_as(
            r#"
            UPDATE send_queue q
            SET status = 'cancelled', updated_at = $3
            FROM outreach_messages m
            WHERE q.message_id = m.id
              AND m.recipient_email = $1
              AND q.status = 'pending'
              AND ($2::uuid IS NULL OR q.message_id <> $2)
            RETURNING q.message_id
            "#,
        )
        .bind(normalize_email(email))
        .bind(except_message)
        .bind(at)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut message_ids = Vec::with_capacity(cancelled.len());
        for (message_id,) in cancelled {
            if let Some(message) = lock_message(&mut tx, message_id).await? {
                absorb_locked(&mut tx, message, Signal::Cancelled, at).await?;
            }
            message_ids.push(message_id);
        }

        tx.commit().await.map_err(db_err)?;

        if !message_ids.is_empty() {
            info!(
                count = message_ids.len(),
                "Cancelled pending sends for suppressed recipient"
            );
        }
        Ok(message_ids)
    }

    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE send_queue
            SET status = 'pending', claimed_at = NULL, updated_at = $2
            WHERE status = 'processing' AND claimed_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
