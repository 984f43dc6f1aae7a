//! Send Scheduler - Claims due queue items and hands them to the gateway

use super::rate_limiter::RateLimiter;
use crate::automation::AutomationDispatcher;
use crate::gateway::{DeliveryGateway, GatewayError, OutboundEmail};
use crate::metrics::CoreMetrics;
use chrono::Duration;
use outreach_common::config::SchedulerConfig;
use outreach_common::types::{EventKind, MessageId, QueueItemId, Timestamp};
use outreach_common::{Clock, Error, Result, Signal};
use outreach_storage::models::{NewQueueItem, OutreachMessage, SendQueueItem};
use outreach_storage::repository::{MessageRepository, QueueRepository, SuppressionRepository};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, Duration as TokioDuration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A request to send a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub message_id: MessageId,
    pub account_id: String,
    #[serde(default)]
    pub priority: i16,
    #[serde(default)]
    pub not_before: Option<Timestamp>,
}

/// What a batch did with the items it claimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub sent: usize,
    pub retried: usize,
    pub deferred: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Sent => self.sent += 1,
            ItemOutcome::Retried => self.retried += 1,
            ItemOutcome::Deferred => self.deferred += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// Items the batch handled
    pub fn total(&self) -> usize {
        self.sent + self.retried + self.deferred + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Sent,
    Retried,
    Deferred,
    Failed,
    Cancelled,
}

impl ItemOutcome {
    fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Sent => "sent",
            ItemOutcome::Retried => "retried",
            ItemOutcome::Deferred => "deferred",
            ItemOutcome::Failed => "failed",
            ItemOutcome::Cancelled => "cancelled",
        }
    }
}

/// Send Scheduler
pub struct SendScheduler {
    queue: Arc<dyn QueueRepository>,
    messages: Arc<dyn MessageRepository>,
    suppressions: Arc<dyn SuppressionRepository>,
    rate_limiter: Arc<RateLimiter>,
    gateway: Arc<dyn DeliveryGateway>,
    dispatcher: Arc<AutomationDispatcher>,
    clock: Arc<dyn Clock>,
    metrics: Arc<CoreMetrics>,
    config: SchedulerConfig,
}

impl SendScheduler {
    /// Create a new send scheduler
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn QueueRepository>,
        messages: Arc<dyn MessageRepository>,
        suppressions: Arc<dyn SuppressionRepository>,
        rate_limiter: Arc<RateLimiter>,
        gateway: Arc<dyn DeliveryGateway>,
        dispatcher: Arc<AutomationDispatcher>,
        clock: Arc<dyn Clock>,
        metrics: Arc<CoreMetrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            messages,
            suppressions,
            rate_limiter,
            gateway,
            dispatcher,
            clock,
            metrics,
            config,
        }
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    /// Queue a message for sending.
    ///
    /// The item is due at the account's next available slot, or at
    /// `not_before` if that is later. Returns the existing item when the
    /// message is already queued.
    pub async fn enqueue(&self, request: SendRequest) -> Result<SendQueueItem> {
        let now = self.clock.now();
        let slot = self
            .rate_limiter
            .next_available_slot(&request.account_id)
            .await?;
        let scheduled_for = request.not_before.map_or(slot, |at| at.max(slot));

        let outcome = self
            .queue
            .enqueue(
                NewQueueItem {
                    message_id: request.message_id,
                    account_id: request.account_id,
                    scheduled_for,
                    priority: request.priority,
                    max_attempts: self.config.max_attempts,
                },
                now,
            )
            .await?;

        if outcome.created {
            info!(
                item_id = %outcome.item.id,
                message_id = %outcome.item.message_id,
                scheduled_for = %outcome.item.scheduled_for,
                "Message queued"
            );
        } else {
            debug!(
                item_id = %outcome.item.id,
                message_id = %outcome.item.message_id,
                "Message already queued"
            );
        }
        Ok(outcome.item)
    }

    /// Withdraw a queued send. Only `pending` items can be cancelled; an item
    /// already claimed by a sender finishes its attempt. Returns whether the
    /// item was cancelled.
    pub async fn cancel(&self, item_id: QueueItemId) -> Result<bool> {
        let now = self.clock.now();
        let item = self
            .queue
            .get(item_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Queue item {} not found", item_id)))?;

        if !self.queue.cancel(item.id, now).await? {
            debug!(
                item_id = %item.id,
                status = %item.status,
                "Queue item is not pending, not cancelled"
            );
            return Ok(false);
        }

        self.messages
            .apply_signal(item.message_id, Signal::Cancelled, now)
            .await?;
        info!(item_id = %item.id, message_id = %item.message_id, "Queued send cancelled");
        Ok(true)
    }

    /// Run the scheduler until the shutdown signal
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TokioDuration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            interval_secs = self.config.poll_interval_secs,
            "Send scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.recover_stale_claims().await {
                        warn!(error = %e, "Error recovering stale claims");
                    }
                    match self.process_batch().await {
                        Ok(report) if report.total() > 0 => {
                            info!(
                                sent = report.sent,
                                retried = report.retried,
                                deferred = report.deferred,
                                failed = report.failed,
                                cancelled = report.cancelled,
                                "Send batch processed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Error processing send batch"),
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Send scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Return abandoned `processing` claims to the queue
    pub async fn recover_stale_claims(&self) -> Result<u64> {
        let now = self.clock.now();
        let timeout = Duration::seconds(self.config.claim_timeout_secs as i64);
        let released = self.queue.release_stale_claims(now - timeout, now).await?;
        if released > 0 {
            warn!(count = released, "Released stale queue claims");
        }
        Ok(released)
    }

    /// Claim and send every item that is due
    pub async fn process_batch(self: &Arc<Self>) -> Result<BatchReport> {
        let now = self.clock.now();
        let due = self.queue.due(now, self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(BatchReport::default());
        }

        debug!(count = due.len(), "Processing due queue items");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::new();

        for candidate in due {
            let item = match self.queue.claim(candidate.id, now).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    debug!(item_id = %candidate.id, "Item claimed by another worker");
                    continue;
                }
                Err(e) => {
                    // Items already spawned are still joined below
                    error!(item_id = %candidate.id, error = %e, "Failed to claim queue item");
                    self.metrics.scheduler("error");
                    break;
                }
            };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("Send semaphore closed: {}", e)))?;
            let scheduler = Arc::clone(self);

            handles.push(tokio::spawn(async move {
                let item_id = item.id;
                let outcome = scheduler.process_item(item).await;
                drop(permit);
                (item_id, outcome)
            }));
        }

        let mut report = BatchReport::default();
        for handle in handles {
            match handle.await {
                Ok((_, Ok(outcome))) => {
                    self.metrics.scheduler(outcome.label());
                    report.record(outcome);
                }
                Ok((item_id, Err(e))) => {
                    error!(item_id = %item_id, error = %e, "Error processing queue item");
                    self.metrics.scheduler("error");
                }
                Err(e) => {
                    error!(error = %e, "Send task panicked");
                    self.metrics.scheduler("error");
                }
            }
        }

        Ok(report)
    }

    async fn process_item(&self, item: SendQueueItem) -> Result<ItemOutcome> {
        let now = self.clock.now();

        let message = match self.messages.get(item.message_id).await? {
            Some(message) if !message.state_enum()?.is_terminal() => message,
            Some(message) => {
                info!(
                    item_id = %item.id,
                    message_id = %message.id,
                    state = %message.state,
                    "Message concluded before send, cancelling item"
                );
                self.queue.abandon(item.id, now).await?;
                return Ok(ItemOutcome::Cancelled);
            }
            None => {
                warn!(item_id = %item.id, message_id = %item.message_id, "Queued message no longer exists");
                self.queue.abandon(item.id, now).await?;
                return Ok(ItemOutcome::Cancelled);
            }
        };

        if self.suppressions.is_suppressed(&message.recipient_email).await? {
            info!(
                item_id = %item.id,
                message_id = %message.id,
                "Recipient is suppressed, cancelling item"
            );
            self.queue.abandon(item.id, now).await?;
            self.messages
                .apply_signal(message.id, Signal::Cancelled, now)
                .await?;
            return Ok(ItemOutcome::Cancelled);
        }

        let Some(reservation) = self.rate_limiter.reserve(&item.account_id).await? else {
            let slot = self.rate_limiter.next_available_slot(&item.account_id).await?;
            debug!(
                item_id = %item.id,
                account_id = %item.account_id,
                until = %slot,
                "No headroom, deferring item"
            );
            self.queue.defer(item.id, slot, now).await?;
            return Ok(ItemOutcome::Deferred);
        };

        let email = OutboundEmail {
            to: message.recipient_email.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
        };
        let attempts = item.attempts + 1;

        match self.gateway.send(&item.account_id, &email).await {
            Ok(receipt) => {
                let now = self.clock.now();
                self.queue.mark_sent(item.id, attempts, now).await?;
                self.messages
                    .record_dispatch(
                        message.id,
                        receipt.provider_message_id.as_deref(),
                        receipt.provider_thread_id.as_deref(),
                        now,
                    )
                    .await?;
                info!(
                    item_id = %item.id,
                    message_id = %message.id,
                    attempts = attempts,
                    "Message sent"
                );
                Ok(ItemOutcome::Sent)
            }
            Err(failure) => {
                if let Err(e) = self.rate_limiter.release(&reservation).await {
                    warn!(account_id = %item.account_id, error = %e, "Failed to release rate reservation");
                }
                self.handle_failure(item, message, attempts, failure).await
            }
        }
    }

    async fn handle_failure(
        &self,
        item: SendQueueItem,
        message: OutreachMessage,
        attempts: i32,
        failure: GatewayError,
    ) -> Result<ItemOutcome> {
        let now = self.clock.now();
        let reason = failure.to_string();

        if failure.is_transient() && attempts < item.max_attempts {
            let until = now
                + calculate_backoff(attempts)
                + retry_jitter(item.id, attempts, self.config.retry_jitter_secs);
            self.queue
                .schedule_retry(item.id, attempts, &reason, until, now)
                .await?;
            warn!(
                item_id = %item.id,
                attempts = attempts,
                retry_at = %until,
                error = %reason,
                "Send failed, retry scheduled"
            );
            return Ok(ItemOutcome::Retried);
        }

        self.queue
            .mark_failed(item.id, attempts, &reason, now)
            .await?;
        let message = self
            .messages
            .apply_signal(message.id, EventKind::SendFailed.into(), now)
            .await?
            .map_or(message, |(updated, _)| updated);

        error!(
            item_id = %item.id,
            message_id = %message.id,
            attempts = attempts,
            error = %reason,
            "Send failed permanently"
        );

        let failed_item = SendQueueItem {
            attempts,
            last_error: Some(reason),
            ..item
        };
        self.dispatcher
            .handle_failed_send(&failed_item, &message, &failure)
            .await;

        Ok(ItemOutcome::Failed)
    }
}

/// Exponential backoff: 2^attempts minutes, capped at 4 hours
fn calculate_backoff(attempts: i32) -> Duration {
    let minutes = std::cmp::min(2_i64.pow(attempts.clamp(0, 16) as u32), 240);
    Duration::minutes(minutes)
}

/// Deterministic per-item offset in `[0, max_secs)`
fn retry_jitter(item_id: QueueItemId, attempts: i32, max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::zero();
    }
    let mut hasher = Sha256::new();
    hasher.update(item_id.as_bytes());
    hasher.update(attempts.to_be_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    Duration::seconds((u64::from_be_bytes(head) % max_secs) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(0), Duration::minutes(1));
        assert_eq!(calculate_backoff(1), Duration::minutes(2));
        assert_eq!(calculate_backoff(2), Duration::minutes(4));
        assert_eq!(calculate_backoff(3), Duration::minutes(8));
        assert_eq!(calculate_backoff(10), Duration::minutes(240));
        assert_eq!(calculate_backoff(99), Duration::minutes(240));
    }

    #[test]
    fn test_retry_jitter_is_stable_and_bounded() {
        let id = Uuid::new_v4();
        assert_eq!(retry_jitter(id, 1, 30), retry_jitter(id, 1, 30));
        assert_eq!(retry_jitter(id, 1, 0), Duration::zero());

        for attempts in 0..50 {
            let jitter = retry_jitter(Uuid::new_v4(), attempts, 30);
            assert!(jitter >= Duration::zero() && jitter < Duration::seconds(30));
        }
    }

    #[test]
    fn test_batch_report_counts() {
        let mut report = BatchReport::default();
        report.record(ItemOutcome::Sent);
        report.record(ItemOutcome::Deferred);
        report.record(ItemOutcome::Sent);
        assert_eq!(report.sent, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.total(), 3);
    }
}
