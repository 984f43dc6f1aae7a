//! Inbound event repository

use crate::db::{db_err, DatabasePool};
use crate::models::{
    InboundEvent, IngestOutcome, MessageRef, NewInboundEvent, OutreachMessage,
};
use crate::repository::messages::absorb_locked;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_common::types::{normalize_email, MessageId};
use outreach_common::{Result, Signal};
use sqlx::PgConnection;
use tracing::debug;

/// Inbound event repository trait
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Record an event and apply it to its message in one atomic step.
    ///
    /// The first caller for a provider event id wins; every later call
    /// returns [`IngestOutcome::Duplicate`] and changes nothing. The message
    /// is resolved by provider message id, then thread id, then the most
    /// recent message to the recipient created at or after `recipient_since`.
    async fn ingest(
        &self,
        event: NewInboundEvent,
        received_at: DateTime<Utc>,
        recipient_since: DateTime<Utc>,
    ) -> Result<IngestOutcome>;

    async fn list_for_message(&self, message_id: MessageId) -> Result<Vec<InboundEvent>>;
}

/// Database inbound event repository
pub struct DbEventRepository {
    pool: DatabasePool,
}

impl DbEventRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

async fn resolve_locked(
    conn: &mut PgConnection,
    message_ref: &MessageRef,
    recipient_since: DateTime<Utc>,
) -> Result<Option<OutreachMessage>> {
    if let Some(provider_message_id) = &message_ref.provider_message_id {
        let found = sqlx::query_as::<_, OutreachMessage>(
            r#"
            SELECT * FROM outreach_messages WHERE provider_message_id = $1
            ORDER BY created_at DESC LIMIT 1 FOR UPDATE
            "#,
        )
        .bind(provider_message_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
        if found.is_some() {
            return Ok(found);
        }
    }

    if let Some(thread_id) = &message_ref.provider_thread_id {
        let found = sqlx::query_as::<_, OutreachMessage>(
            r#"
            SELECT * FROM outreach_messages WHERE provider_thread_id = $1
            ORDER BY created_at DESC LIMIT 1 FOR UPDATE
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
        if found.is_some() {
            return Ok(found);
        }
    }

    if let Some(email) = &message_ref.recipient_email {
        return sqlx::query_as::<_, OutreachMessage>(
            r#"
            SELECT * FROM outreach_messages
            WHERE recipient_email = $1 AND created_at >= $2
            ORDER BY created_at DESC LIMIT 1 FOR UPDATE
            "#,
        )
        .bind(normalize_email(email))
        .bind(recipient_since)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err);
    }

    Ok(None)
}

#[async_trait]
impl EventRepository for DbEventRepository {
    async fn ingest(
        &self,
        event: NewInboundEvent,
        received_at: DateTime<Utc>,
        recipient_since: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let kind = event.kind;
        let message_ref = event.message_ref.clone();
        let row = event.into_row(received_at);

        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let inserted = sqlx::query_as::<_, InboundEvent>(
            r#"
            INSERT INTO inbound_events (
                id, provider_event_id, provider, event_type, occurred_at,
                bounce_severity, id_synthesized, payload, is_duplicate, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, $9)
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(row.id)
        .bind(&row.provider_event_id)
        .bind(&row.provider)
        .bind(&row.event_type)
        .bind(row.occurred_at)
        .bind(&row.bounce_severity)
        .bind(row.id_synthesized)
        .bind(&row.payload)
        .bind(row.received_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(mut stored) = inserted else {
            tx.rollback().await.map_err(db_err)?;
            debug!(provider_event_id = %row.provider_event_id, "Duplicate event ignored");
            return Ok(IngestOutcome::Duplicate);
        };

        let Some(message) = resolve_locked(&mut tx, &message_ref, recipient_since).await? else {
            tx.commit().await.map_err(db_err)?;
            return Ok(IngestOutcome::Recorded {
                event: stored,
                message: None,
                transition: None,
            });
        };

        sqlx::query("UPDATE inbound_events SET message_id = $2 WHERE id = $1")
            .bind(stored.id)
            .bind(message.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        stored.message_id = Some(message.id);

        let (message, transition) =
            absorb_locked(&mut tx, message, Signal::Event(kind), stored.occurred_at).await?;

        tx.commit().await.map_err(db_err)?;

        Ok(IngestOutcome::Recorded {
            event: stored,
            message: Some(message),
            transition: Some(transition),
        })
    }

    async fn list_for_message(&self, message_id: MessageId) -> Result<Vec<InboundEvent>> {
        sqlx::query_as::<_, InboundEvent>(
            "SELECT * FROM inbound_events WHERE message_id = $1 ORDER BY occurred_at ASC, received_at ASC",
        )
        .bind(message_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
