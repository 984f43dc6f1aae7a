//! Rate Limiter - Rolling hourly and daily send limits per account

use outreach_common::config::RateLimitConfig;
use outreach_common::types::Timestamp;
use outreach_common::{Clock, Result};
use outreach_storage::models::{AccountRateCounter, RemainingQuota};
use outreach_storage::repository::RateCounterRepository;
use std::sync::Arc;
use tracing::debug;

/// A counted send that has not been confirmed yet
#[derive(Debug, Clone)]
pub struct Reservation {
    pub account_id: String,
    /// Counter as it was right after the increment
    pub snapshot: AccountRateCounter,
}

/// Rate limiter for controlling send rates per account
pub struct RateLimiter {
    counters: Arc<dyn RateCounterRepository>,
    limits: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(
        counters: Arc<dyn RateCounterRepository>,
        limits: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            counters,
            limits,
            clock,
        }
    }

    async fn observe(&self, account_id: &str) -> Result<AccountRateCounter> {
        self.counters
            .observe(account_id, self.limits.limits_for(account_id), self.clock.now())
            .await
    }

    /// Whether one more send fits in both windows
    pub async fn has_headroom(&self, account_id: &str) -> Result<bool> {
        Ok(self.observe(account_id).await?.has_headroom())
    }

    /// Earliest time the account can send; now when it has headroom
    pub async fn next_available_slot(&self, account_id: &str) -> Result<Timestamp> {
        let counter = self.observe(account_id).await?;
        Ok(counter.next_available_slot(self.clock.now()))
    }

    /// Count one send. Returns false, leaving the counters untouched, when
    /// either limit would be exceeded.
    pub async fn record_send(&self, account_id: &str) -> Result<bool> {
        Ok(self.reserve(account_id).await?.is_some())
    }

    /// Count one send and keep what is needed to give it back
    pub async fn reserve(&self, account_id: &str) -> Result<Option<Reservation>> {
        let outcome = self
            .counters
            .try_record(account_id, self.limits.limits_for(account_id), self.clock.now())
            .await?;

        if !outcome.recorded {
            debug!(
                account_id = %account_id,
                hourly = outcome.counter.hourly_count,
                daily = outcome.counter.daily_count,
                "Rate limit reached"
            );
            return Ok(None);
        }

        Ok(Some(Reservation {
            account_id: account_id.to_string(),
            snapshot: outcome.counter,
        }))
    }

    /// Give back a reservation whose send did not go out
    pub async fn release(&self, reservation: &Reservation) -> Result<()> {
        self.counters
            .release(
                &reservation.account_id,
                &reservation.snapshot,
                self.clock.now(),
            )
            .await
    }

    /// Remaining sends in each window
    pub async fn remaining(&self, account_id: &str) -> Result<RemainingQuota> {
        Ok(self.observe(account_id).await?.remaining())
    }
}
