//! Service wiring - Builds the processor, scheduler and dispatcher once

use crate::automation::{AutomationDispatcher, ReplyClassifier, RuleBasedReplyClassifier};
use crate::events::{EventProcessor, ProcessOutcome};
use crate::gateway::DeliveryGateway;
use crate::metrics::CoreMetrics;
use crate::scheduled::{BatchReport, RateLimiter, SendRequest, SendScheduler};
use outreach_common::types::QueueItemId;
use outreach_common::{Clock, Config, Result};
use outreach_storage::models::{NewOutreachMessage, OutreachMessage, SendQueueItem};
use outreach_storage::repository::{
    DbEventRepository, DbMessageRepository, DbQueueRepository, DbRateCounterRepository,
    DbReviewTaskRepository, DbSuppressionRepository, EventRepository, MessageRepository,
    QueueRepository, RateCounterRepository, ReviewTaskRepository, SuppressionRepository,
};
use outreach_storage::{DatabasePool, MemoryStore};
use std::sync::Arc;

/// The storage seams the core depends on
#[derive(Clone)]
pub struct Repositories {
    pub messages: Arc<dyn MessageRepository>,
    pub events: Arc<dyn EventRepository>,
    pub queue: Arc<dyn QueueRepository>,
    pub counters: Arc<dyn RateCounterRepository>,
    pub suppressions: Arc<dyn SuppressionRepository>,
    pub tasks: Arc<dyn ReviewTaskRepository>,
}

impl Repositories {
    /// Every repository backed by one in-process store
    pub fn memory(store: MemoryStore) -> Self {
        Self {
            messages: Arc::new(store.clone()),
            events: Arc::new(store.clone()),
            queue: Arc::new(store.clone()),
            counters: Arc::new(store.clone()),
            suppressions: Arc::new(store.clone()),
            tasks: Arc::new(store),
        }
    }

    /// Every repository backed by PostgreSQL
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            messages: Arc::new(DbMessageRepository::new(pool.clone())),
            events: Arc::new(DbEventRepository::new(pool.clone())),
            queue: Arc::new(DbQueueRepository::new(pool.clone())),
            counters: Arc::new(DbRateCounterRepository::new(pool.clone())),
            suppressions: Arc::new(DbSuppressionRepository::new(pool.clone())),
            tasks: Arc::new(DbReviewTaskRepository::new(pool)),
        }
    }
}

/// Outreach delivery core
pub struct OutreachCore {
    repos: Repositories,
    processor: Arc<EventProcessor>,
    scheduler: Arc<SendScheduler>,
    metrics: Arc<CoreMetrics>,
    clock: Arc<dyn Clock>,
}

impl OutreachCore {
    /// Build the core with the built-in reply classifier
    pub fn new(
        config: &Config,
        repos: Repositories,
        gateway: Arc<dyn DeliveryGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_classifier(
            config,
            repos,
            gateway,
            Arc::new(RuleBasedReplyClassifier::new()),
            clock,
        )
    }

    /// Build the core with a custom reply classifier
    pub fn with_classifier(
        config: &Config,
        repos: Repositories,
        gateway: Arc<dyn DeliveryGateway>,
        classifier: Arc<dyn ReplyClassifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let metrics = Arc::new(CoreMetrics::new()?);

        let dispatcher = Arc::new(AutomationDispatcher::new(
            repos.messages.clone(),
            repos.queue.clone(),
            repos.suppressions.clone(),
            repos.tasks.clone(),
            classifier,
            clock.clone(),
            metrics.clone(),
        ));

        let processor = Arc::new(EventProcessor::new(
            repos.events.clone(),
            dispatcher.clone(),
            clock.clone(),
            metrics.clone(),
            config.events.dedup_cache_size,
            config.events.recipient_lookback_days,
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            repos.counters.clone(),
            config.rate_limits.clone(),
            clock.clone(),
        ));

        let scheduler = Arc::new(SendScheduler::new(
            repos.queue.clone(),
            repos.messages.clone(),
            repos.suppressions.clone(),
            rate_limiter,
            gateway,
            dispatcher,
            clock.clone(),
            metrics.clone(),
            config.scheduler.clone(),
        ));

        Ok(Self {
            repos,
            processor,
            scheduler,
            metrics,
            clock,
        })
    }

    /// Create a draft message
    pub async fn create_message(&self, input: NewOutreachMessage) -> Result<OutreachMessage> {
        self.repos.messages.create(input, self.clock.now()).await
    }

    /// Handle one webhook delivery
    pub async fn process_event(&self, raw: serde_json::Value) -> Result<ProcessOutcome> {
        self.processor.process_event(raw).await
    }

    /// Queue a message; never waits for rate-limit headroom
    pub async fn enqueue(&self, request: SendRequest) -> Result<SendQueueItem> {
        self.scheduler.enqueue(request).await
    }

    /// Cancel a pending send and withdraw its message
    pub async fn cancel_send(&self, item_id: QueueItemId) -> Result<bool> {
        self.scheduler.cancel(item_id).await
    }

    /// Run one scheduler pass
    pub async fn process_batch(&self) -> Result<BatchReport> {
        self.scheduler.process_batch().await
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn processor(&self) -> Arc<EventProcessor> {
        self.processor.clone()
    }

    pub fn scheduler(&self) -> Arc<SendScheduler> {
        self.scheduler.clone()
    }

    pub fn metrics(&self) -> Arc<CoreMetrics> {
        self.metrics.clone()
    }
}
