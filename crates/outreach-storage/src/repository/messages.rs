//! Outreach message repository

use crate::db::{db_err, DatabasePool};
use crate::models::{NewOutreachMessage, OutreachMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_common::types::{normalize_email, MessageId, MessageState, SendStatus};
use outreach_common::{Error, Result, Signal, Transition};
use sqlx::PgConnection;
use tracing::debug;
use uuid::Uuid;

/// Outreach message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, input: NewOutreachMessage, at: DateTime<Utc>) -> Result<OutreachMessage>;
    async fn get(&self, id: MessageId) -> Result<Option<OutreachMessage>>;

    /// Run a signal through the message's state machine under a row lock.
    ///
    /// Returns `None` when the message does not exist.
    async fn apply_signal(
        &self,
        id: MessageId,
        signal: Signal,
        at: DateTime<Utc>,
    ) -> Result<Option<(OutreachMessage, Transition)>>;

    /// Store the provider identifiers returned by a successful send
    async fn record_dispatch(
        &self,
        id: MessageId,
        provider_message_id: Option<&str>,
        provider_thread_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Database outreach message repository
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

/// Load a message and hold its row lock until the surrounding transaction ends
pub(crate) async fn lock_message(
    conn: &mut PgConnection,
    id: MessageId,
) -> Result<Option<OutreachMessage>> {
    sqlx::query_as::<_, OutreachMessage>("SELECT * FROM outreach_messages WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(db_err)
}

/// Write back the lifecycle columns of a message
pub(crate) async fn persist_lifecycle(
    conn: &mut PgConnection,
    message: &OutreachMessage,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE outreach_messages SET
            state = $2, send_status = $3, open_count = $4, click_count = $5,
            sent_at = $6, opened_at = $7, clicked_at = $8, replied_at = $9,
            bounced_at = $10, failed_at = $11, updated_at = $12
        WHERE id = $1
        "#,
    )
    .bind(message.id)
    .bind(&message.state)
    .bind(&message.send_status)
    .bind(message.open_count)
    .bind(message.click_count)
    .bind(message.sent_at)
    .bind(message.opened_at)
    .bind(message.clicked_at)
    .bind(message.replied_at)
    .bind(message.bounced_at)
    .bind(message.failed_at)
    .bind(message.updated_at)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Absorb a signal into a locked message and persist it if anything changed
pub(crate) async fn absorb_locked(
    conn: &mut PgConnection,
    mut message: OutreachMessage,
    signal: Signal,
    at: DateTime<Utc>,
) -> Result<(OutreachMessage, Transition)> {
    let transition = message.absorb(signal, at)?;
    if transition.changed {
        persist_lifecycle(conn, &message).await?;
        debug!(
            message_id = %message.id,
            signal = %signal,
            from = %transition.from,
            to = %transition.to,
            "Message transition applied"
        );
    }
    Ok((message, transition))
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn create(&self, input: NewOutreachMessage, at: DateTime<Utc>) -> Result<OutreachMessage> {
        if input.recipient_email.trim().is_empty() {
            return Err(Error::Validation("Recipient email is required".to_string()));
        }

        sqlx::query_as::<_, OutreachMessage>(
            r#"
            INSERT INTO outreach_messages (
                id, campaign_id, recipient_id, recipient_email, account_id,
                subject, body, state, send_status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.campaign_id)
        .bind(input.recipient_id)
        .bind(normalize_email(&input.recipient_email))
        .bind(&input.account_id)
        .bind(&input.subject)
        .bind(&input.body)
        .bind(MessageState::Draft.to_string())
        .bind(SendStatus::Pending.to_string())
        .bind(at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutreachMessage>> {
        sqlx::query_as::<_, OutreachMessage>("SELECT * FROM outreach_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn apply_signal(
        &self,
        id: MessageId,
        signal: Signal,
        at: DateTime<Utc>,
    ) -> Result<Option<(OutreachMessage, Transition)>> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let Some(message) = lock_message(&mut tx, id).await? else {
            return Ok(None);
        };
        let applied = absorb_locked(&mut tx, message, signal, at).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(applied))
    }

    async fn record_dispatch(
        &self,
        id: MessageId,
        provider_message_id: Option<&str>,
        provider_thread_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outreach_messages SET
                provider_message_id = COALESCE($2, provider_message_id),
                provider_thread_id = COALESCE($3, provider_thread_id),
                send_status = $4,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(provider_message_id)
        .bind(provider_thread_id)
        .bind(SendStatus::Sent.to_string())
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Message {} not found", id)));
        }
        Ok(())
    }
}
