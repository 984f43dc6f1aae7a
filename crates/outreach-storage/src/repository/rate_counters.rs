//! Account rate counter repository

use crate::db::{db_err, DatabasePool};
use crate::models::{AccountRateCounter, RecordOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_common::config::AccountLimits;
use outreach_common::{Error, Result};

/// Account rate counter repository trait
#[async_trait]
pub trait RateCounterRepository: Send + Sync {
    /// Current counter, created on first use and rolled over past any elapsed window.
    /// The stored limits are replaced by `limits` on every call.
    async fn observe(
        &self,
        account_id: &str,
        limits: AccountLimits,
        now: DateTime<Utc>,
    ) -> Result<AccountRateCounter>;

    /// Count one send if, after rollover, both windows have room.
    ///
    /// The check and the increment are a single atomic step, so concurrent
    /// callers can never push a counter past its limit.
    async fn try_record(
        &self,
        account_id: &str,
        limits: AccountLimits,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome>;

    /// Give back a send counted by `try_record`; `reserved` is the counter it returned
    async fn release(
        &self,
        account_id: &str,
        reserved: &AccountRateCounter,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn get(&self, account_id: &str) -> Result<Option<AccountRateCounter>>;
}

/// Database account rate counter repository
pub struct DbRateCounterRepository {
    pool: DatabasePool,
}

impl DbRateCounterRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn ensure_row(
        &self,
        account_id: &str,
        limits: AccountLimits,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let fresh = AccountRateCounter::fresh(account_id, limits, now);
        sqlx::query(
            r#"
            INSERT INTO account_rate_counters (
                account_id, daily_count, hourly_count, daily_limit, hourly_limit,
                daily_reset_at, hourly_reset_at, total_sent_lifetime, updated_at
            )
            VALUES ($1, 0, 0, $2, $3, $4, $5, 0, $6)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(&fresh.account_id)
        .bind(fresh.daily_limit)
        .bind(fresh.hourly_limit)
        .bind(fresh.daily_reset_at)
        .bind(fresh.hourly_reset_at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl RateCounterRepository for DbRateCounterRepository {
    async fn observe(
        &self,
        account_id: &str,
        limits: AccountLimits,
        now: DateTime<Utc>,
    ) -> Result<AccountRateCounter> {
        self.ensure_row(account_id, limits, now).await?;

        // Every right-hand side reads the pre-update row
        sqlx::query_as::<_, AccountRateCounter>(
            r#"
            UPDATE account_rate_counters SET
                hourly_count = CASE WHEN $2 >= hourly_reset_at THEN 0 ELSE hourly_count END,
                hourly_reset_at = CASE WHEN $2 >= hourly_reset_at
                    THEN $2 + INTERVAL '1 hour' ELSE hourly_reset_at END,
                daily_count = CASE WHEN $2 >= daily_reset_at THEN 0 ELSE daily_count END,
                daily_reset_at = CASE WHEN $2 >= daily_reset_at
                    THEN $2 + INTERVAL '24 hours' ELSE daily_reset_at END,
                daily_limit = $3,
                hourly_limit = $4,
                updated_at = CASE WHEN $2 >= hourly_reset_at OR $2 >= daily_reset_at
                    THEN $2 ELSE updated_at END
            WHERE account_id = $1
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(now)
        .bind(limits.daily_limit)
        .bind(limits.hourly_limit)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn try_record(
        &self,
        account_id: &str,
        limits: AccountLimits,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome> {
        self.ensure_row(account_id, limits, now).await?;

        let recorded = sqlx::query_as::<_, AccountRateCounter>(
            r#"
            UPDATE account_rate_counters SET
                hourly_count = (CASE WHEN $2 >= hourly_reset_at THEN 0 ELSE hourly_count END) + 1,
                hourly_reset_at = CASE WHEN $2 >= hourly_reset_at
                    THEN $2 + INTERVAL '1 hour' ELSE hourly_reset_at END,
                daily_count = (CASE WHEN $2 >= daily_reset_at THEN 0 ELSE daily_count END) + 1,
                daily_reset_at = CASE WHEN $2 >= daily_reset_at
                    THEN $2 + INTERVAL '24 hours' ELSE daily_reset_at END,
                total_sent_lifetime = total_sent_lifetime + 1,
                daily_limit = $3,
                hourly_limit = $4,
                last_send_at = $2,
                updated_at = $2
            WHERE account_id = $1
              AND (CASE WHEN $2 >= hourly_reset_at THEN 0 ELSE hourly_count END) < $4
              AND (CASE WHEN $2 >= daily_reset_at THEN 0 ELSE daily_count END) < $3
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(now)
        .bind(limits.daily_limit)
        .bind(limits.hourly_limit)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?;

        match recorded {
            Some(counter) => Ok(RecordOutcome {
                recorded: true,
                counter,
            }),
            None => Ok(RecordOutcome {
                recorded: false,
                counter: self.observe(account_id, limits, now).await?,
            }),
        }
    }

    async fn release(
        &self,
        account_id: &str,
        reserved: &AccountRateCounter,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE account_rate_counters SET
                hourly_count = CASE WHEN hourly_reset_at = $2
                    THEN GREATEST(hourly_count - 1, 0) ELSE hourly_count END,
                daily_count = CASE WHEN daily_reset_at = $3
                    THEN GREATEST(daily_count - 1, 0) ELSE daily_count END,
                total_sent_lifetime = GREATEST(total_sent_lifetime - 1, 0),
                updated_at = $4
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(reserved.hourly_reset_at)
        .bind(reserved.daily_reset_at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Rate counter for account {} not found",
                account_id
            )));
        }
        Ok(())
    }

    async fn get(&self, account_id: &str) -> Result<Option<AccountRateCounter>> {
        sqlx::query_as::<_, AccountRateCounter>(
            "SELECT * FROM account_rate_counters WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
