//! Review task repository

use crate::db::{db_err, DatabasePool};
use crate::models::{NewReviewTask, ReviewTask};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_common::Result;
use uuid::Uuid;

/// Review task repository trait
#[async_trait]
pub trait ReviewTaskRepository: Send + Sync {
    /// Create a task unless one with the same idempotency key exists.
    ///
    /// Returns `None` when the key was already used.
    async fn create(&self, input: NewReviewTask, at: DateTime<Utc>) -> Result<Option<ReviewTask>>;

    async fn list_for_related(&self, related_id: Uuid) -> Result<Vec<ReviewTask>>;
}

/// Database review task repository
pub struct DbReviewTaskRepository {
    pool: DatabasePool,
}

impl DbReviewTaskRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReviewTaskRepository for DbReviewTaskRepository {
    async fn create(&self, input: NewReviewTask, at: DateTime<Utc>) -> Result<Option<ReviewTask>> {
        sqlx::query_as::<_, ReviewTask>(
            r#"
            INSERT INTO review_tasks (id, kind, related_id, priority, notes, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.kind.to_string())
        .bind(input.related_id)
        .bind(input.priority)
        .bind(&input.notes)
        .bind(&input.idempotency_key)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_for_related(&self, related_id: Uuid) -> Result<Vec<ReviewTask>> {
        sqlx::query_as::<_, ReviewTask>(
            "SELECT * FROM review_tasks WHERE related_id = $1 ORDER BY created_at ASC",
        )
        .bind(related_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
