//! Contact suppression repository

use crate::db::{db_err, DatabasePool};
use crate::models::Suppression;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_common::types::{normalize_email, MessageId};
use outreach_common::Result;

/// Contact suppression repository trait
#[async_trait]
pub trait SuppressionRepository: Send + Sync {
    /// Suppress an address. Returns false if it was already suppressed.
    async fn suppress(
        &self,
        email: &str,
        reason: &str,
        source_message_id: Option<MessageId>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn is_suppressed(&self, email: &str) -> Result<bool>;
    async fn get(&self, email: &str) -> Result<Option<Suppression>>;
}

/// Database contact suppression repository
pub struct DbSuppressionRepository {
    pool: DatabasePool,
}

impl DbSuppressionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SuppressionRepository for DbSuppressionRepository {
    async fn suppress(
        &self,
        email: &str,
        reason: &str,
        source_message_id: Option<MessageId>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO contact_suppressions (email, reason, source_message_id, suppressed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(normalize_email(email))
        .bind(reason)
        .bind(source_message_id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_suppressed(&self, email: &str) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM contact_suppressions WHERE email = $1)",
        )
        .bind(normalize_email(email))
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(row.0)
    }

    async fn get(&self, email: &str) -> Result<Option<Suppression>> {
        sqlx::query_as::<_, Suppression>("SELECT * FROM contact_suppressions WHERE email = $1")
            .bind(normalize_email(email))
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }
}
