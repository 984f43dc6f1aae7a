//! In-process storage backend
//!
//! Keeps every table behind a single async mutex, which makes each
//! repository call atomic with respect to all others. Used by the `memory`
//! database backend and by tests.

use crate::models::{
    AccountRateCounter, EnqueueOutcome, InboundEvent, IngestOutcome, MessageRef,
    NewInboundEvent, NewOutreachMessage, NewQueueItem, NewReviewTask, OutreachMessage,
    RecordOutcome, ReviewTask, SendQueueItem, Suppression,
};
use crate::repository::{
    EventRepository, MessageRepository, QueueRepository, RateCounterRepository,
    ReviewTaskRepository, SuppressionRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_common::config::AccountLimits;
use outreach_common::types::{
    normalize_email, MessageId, MessageState, QueueItemId, QueueItemStatus, SendStatus,
};
use outreach_common::{Error, Result, Signal, Transition};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    messages: HashMap<MessageId, OutreachMessage>,
    events: Vec<InboundEvent>,
    event_ids: HashSet<String>,
    queue: HashMap<QueueItemId, SendQueueItem>,
    counters: HashMap<String, AccountRateCounter>,
    suppressions: HashMap<String, Suppression>,
    tasks: Vec<ReviewTask>,
}

impl Tables {
    fn resolve(&self, message_ref: &MessageRef, since: DateTime<Utc>) -> Option<MessageId> {
        let latest = |pred: &dyn Fn(&OutreachMessage) -> bool| {
            self.messages
                .values()
                .filter(|m| pred(m))
                .max_by_key(|m| m.created_at)
                .map(|m| m.id)
        };

        if let Some(pmid) = &message_ref.provider_message_id {
            let by_id = |m: &OutreachMessage| m.provider_message_id.as_deref() == Some(pmid.as_str());
            if let Some(id) = latest(&by_id) {
                return Some(id);
            }
        }
        if let Some(thread) = &message_ref.provider_thread_id {
            let by_thread =
                |m: &OutreachMessage| m.provider_thread_id.as_deref() == Some(thread.as_str());
            if let Some(id) = latest(&by_thread) {
                return Some(id);
            }
        }
        if let Some(email) = &message_ref.recipient_email {
            let email = normalize_email(email);
            let by_email = |m: &OutreachMessage| m.recipient_email == email && m.created_at >= since;
            return latest(&by_email);
        }
        None
    }

    fn absorb(
        &mut self,
        id: MessageId,
        signal: Signal,
        at: DateTime<Utc>,
    ) -> Result<Option<(OutreachMessage, Transition)>> {
        let Some(message) = self.messages.get_mut(&id) else {
            return Ok(None);
        };
        let transition = message.absorb(signal, at)?;
        Ok(Some((message.clone(), transition)))
    }

    fn processing_item(&mut self, id: QueueItemId) -> Result<&mut SendQueueItem> {
        match self.queue.get_mut(&id) {
            Some(item) if item.status == QueueItemStatus::Processing.to_string() => Ok(item),
            _ => Err(Error::NotFound(format!(
                "Queue item {} not found or not processing",
                id
            ))),
        }
    }

    fn counter(
        &mut self,
        account_id: &str,
        limits: AccountLimits,
        now: DateTime<Utc>,
    ) -> &mut AccountRateCounter {
        let counter = self
            .counters
            .entry(account_id.to_string())
            .or_insert_with(|| AccountRateCounter::fresh(account_id, limits, now));
        counter.daily_limit = limits.daily_limit;
        counter.hourly_limit = limits.hourly_limit;
        counter.roll_over(now);
        counter
    }
}

/// In-memory implementation of every repository trait
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach provider identifiers to a message, as a gateway send would
    pub async fn set_provider_ids(
        &self,
        id: MessageId,
        provider_message_id: Option<&str>,
        provider_thread_id: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let message = tables
            .messages
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Message {} not found", id)))?;
        message.provider_message_id = provider_message_id.map(str::to_string);
        message.provider_thread_id = provider_thread_id.map(str::to_string);
        Ok(())
    }

    /// All stored events in arrival order
    pub async fn events(&self) -> Vec<InboundEvent> {
        self.tables.lock().await.events.clone()
    }

    /// All review tasks in creation order
    pub async fn review_tasks(&self) -> Vec<ReviewTask> {
        self.tables.lock().await.tasks.clone()
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, input: NewOutreachMessage, at: DateTime<Utc>) -> Result<OutreachMessage> {
        if input.recipient_email.trim().is_empty() {
            return Err(Error::Validation("Recipient email is required".to_string()));
        }

        let message = OutreachMessage {
            id: Uuid::now_v7(),
            campaign_id: input.campaign_id,
            recipient_id: input.recipient_id,
            recipient_email: normalize_email(&input.recipient_email),
            account_id: input.account_id,
            subject: input.subject,
            body: input.body,
            state: MessageState::Draft.to_string(),
            send_status: SendStatus::Pending.to_string(),
            provider_message_id: None,
            provider_thread_id: None,
            open_count: 0,
            click_count: 0,
            sent_at: None,
            opened_at: None,
            clicked_at: None,
            replied_at: None,
            bounced_at: None,
            failed_at: None,
            created_at: at,
            updated_at: at,
        };

        self.tables
            .lock()
            .await
            .messages
            .insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutreachMessage>> {
        Ok(self.tables.lock().await.messages.get(&id).cloned())
    }

    async fn apply_signal(
        &self,
        id: MessageId,
        signal: Signal,
        at: DateTime<Utc>,
    ) -> Result<Option<(OutreachMessage, Transition)>> {
        self.tables.lock().await.absorb(id, signal, at)
    }

    async fn record_dispatch(
        &self,
        id: MessageId,
        provider_message_id: Option<&str>,
        provider_thread_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let message = tables
            .messages
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Message {} not found", id)))?;
        if let Some(pmid) = provider_message_id {
            message.provider_message_id = Some(pmid.to_string());
        }
        if let Some(thread) = provider_thread_id {
            message.provider_thread_id = Some(thread.to_string());
        }
        message.send_status = SendStatus::Sent.to_string();
        message.updated_at = at;
        Ok(())
    }
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn ingest(
        &self,
        event: NewInboundEvent,
        received_at: DateTime<Utc>,
        recipient_since: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let mut tables = self.tables.lock().await;
        if tables.event_ids.contains(&event.provider_event_id) {
            return Ok(IngestOutcome::Duplicate);
        }

        let kind = event.kind;
        let message_ref = event.message_ref.clone();
        let mut stored = event.into_row(received_at);

        let resolved = match tables.resolve(&message_ref, recipient_since) {
            Some(id) => tables.absorb(id, Signal::Event(kind), stored.occurred_at)?,
            None => None,
        };
        stored.message_id = resolved.as_ref().map(|(m, _)| m.id);

        tables.event_ids.insert(stored.provider_event_id.clone());
        tables.events.push(stored.clone());

        let (message, transition) = match resolved {
            Some((m, t)) => (Some(m), Some(t)),
            None => (None, None),
        };
        Ok(IngestOutcome::Recorded {
            event: stored,
            message,
            transition,
        })
    }

    async fn list_for_message(&self, message_id: MessageId) -> Result<Vec<InboundEvent>> {
        let tables = self.tables.lock().await;
        let mut events: Vec<InboundEvent> = tables
            .events
            .iter()
            .filter(|e| e.message_id == Some(message_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.occurred_at, e.received_at));
        Ok(events)
    }
}

#[async_trait]
impl QueueRepository for MemoryStore {
    async fn enqueue(&self, input: NewQueueItem, at: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let mut tables = self.tables.lock().await;
        if !tables.messages.contains_key(&input.message_id) {
            return Err(Error::NotFound(format!(
                "Message {} not found",
                input.message_id
            )));
        }

        let active = tables.queue.values().find(|item| {
            item.message_id == input.message_id
                && matches!(item.status_enum(), Ok(s) if !s.is_terminal())
        });
        if let Some(item) = active {
            return Ok(EnqueueOutcome {
                item: item.clone(),
                created: false,
            });
        }

        let item = SendQueueItem {
            id: Uuid::now_v7(),
            message_id: input.message_id,
            account_id: input.account_id,
            scheduled_for: input.scheduled_for,
            priority: input.priority,
            attempts: 0,
            max_attempts: input.max_attempts,
            status: QueueItemStatus::Pending.to_string(),
            last_error: None,
            claimed_at: None,
            created_at: at,
            updated_at: at,
        };
        tables.queue.insert(item.id, item.clone());
        tables.absorb(input.message_id, Signal::Queued, at)?;

        Ok(EnqueueOutcome {
            item,
            created: true,
        })
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<SendQueueItem>> {
        Ok(self.tables.lock().await.queue.get(&id).cloned())
    }

    async fn list_for_message(&self, message_id: MessageId) -> Result<Vec<SendQueueItem>> {
        let tables = self.tables.lock().await;
        let mut items: Vec<SendQueueItem> = tables
            .queue
            .values()
            .filter(|item| item.message_id == message_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| (item.created_at, item.id));
        Ok(items)
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<SendQueueItem>> {
        let pending = QueueItemStatus::Pending.to_string();
        let tables = self.tables.lock().await;
        let mut items: Vec<SendQueueItem> = tables
            .queue
            .values()
            .filter(|item| item.status == pending && item.scheduled_for <= now)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
                .then(a.id.cmp(&b.id))
        });
        items.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(items)
    }

    async fn claim(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<Option<SendQueueItem>> {
        let mut tables = self.tables.lock().await;
        match tables.queue.get_mut(&id) {
            Some(item) if item.status == QueueItemStatus::Pending.to_string() => {
                item.status = QueueItemStatus::Processing.to_string();
                item.claimed_at = Some(now);
                item.updated_at = now;
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn defer(&self, id: QueueItemId, until: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let item = tables.processing_item(id)?;
        item.status = QueueItemStatus::Pending.to_string();
        item.scheduled_for = until;
        item.claimed_at = None;
        item.updated_at = now;
        Ok(())
    }

    async fn mark_sent(&self, id: QueueItemId, attempts: i32, now: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let item = tables.processing_item(id)?;
        item.status = QueueItemStatus::Sent.to_string();
        item.attempts = attempts;
        item.last_error = None;
        item.claimed_at = None;
        item.updated_at = now;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: QueueItemId,
        attempts: i32,
        error: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let item = tables.processing_item(id)?;
        item.status = QueueItemStatus::Pending.to_string();
        item.attempts = attempts;
        item.last_error = Some(error.to_string());
        item.scheduled_for = until;
        item.claimed_at = None;
        item.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: QueueItemId,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let item = tables.processing_item(id)?;
        item.status = QueueItemStatus::Failed.to_string();
        item.attempts = attempts;
        item.last_error = Some(error.to_string());
        item.claimed_at = None;
        item.updated_at = now;
        Ok(())
    }

    async fn cancel(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.queue.get_mut(&id) {
            Some(item) if item.status == QueueItemStatus::Pending.to_string() => {
                item.status = QueueItemStatus::Cancelled.to_string();
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn abandon(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let item = tables.processing_item(id)?;
        item.status = QueueItemStatus::Cancelled.to_string();
        item.claimed_at = None;
        item.updated_at = now;
        Ok(())
    }

    async fn cancel_pending_for_recipient(
        &self,
        email: &str,
        except_message: Option<MessageId>,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        let email = normalize_email(email);
        let pending = QueueItemStatus::Pending.to_string();
        let mut tables = self.tables.lock().await;

        let recipient_messages: HashSet<MessageId> = tables
            .messages
            .values()
            .filter(|m| m.recipient_email == email && Some(m.id) != except_message)
            .map(|m| m.id)
            .collect();

        let mut cancelled = Vec::new();
        for item in tables.queue.values_mut() {
            if item.status == pending && recipient_messages.contains(&item.message_id) {
                item.status = QueueItemStatus::Cancelled.to_string();
                item.updated_at = at;
                cancelled.push(item.message_id);
            }
        }
        for message_id in &cancelled {
            tables.absorb(*message_id, Signal::Cancelled, at)?;
        }
        Ok(cancelled)
    }

    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let processing = QueueItemStatus::Processing.to_string();
        let mut tables = self.tables.lock().await;
        let mut released = 0;
        for item in tables.queue.values_mut() {
            let stale = item.claimed_at.map_or(false, |at| at < claimed_before);
            if item.status == processing && stale {
                item.status = QueueItemStatus::Pending.to_string();
                item.claimed_at = None;
                item.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl RateCounterRepository for MemoryStore {
    async fn observe(
        &self,
        account_id: &str,
        limits: AccountLimits,
        now: DateTime<Utc>,
    ) -> Result<AccountRateCounter> {
        let mut tables = self.tables.lock().await;
        Ok(tables.counter(account_id, limits, now).clone())
    }

    async fn try_record(
        &self,
        account_id: &str,
        limits: AccountLimits,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome> {
        let mut tables = self.tables.lock().await;
        let counter = tables.counter(account_id, limits, now);
        let recorded = counter.try_record(now);
        Ok(RecordOutcome {
            recorded,
            counter: counter.clone(),
        })
    }

    async fn release(
        &self,
        account_id: &str,
        reserved: &AccountRateCounter,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let counter = tables.counters.get_mut(account_id).ok_or_else(|| {
            Error::NotFound(format!("Rate counter for account {} not found", account_id))
        })?;
        counter.release(reserved, now);
        Ok(())
    }

    async fn get(&self, account_id: &str) -> Result<Option<AccountRateCounter>> {
        Ok(self.tables.lock().await.counters.get(account_id).cloned())
    }
}

#[async_trait]
impl SuppressionRepository for MemoryStore {
    async fn suppress(
        &self,
        email: &str,
        reason: &str,
        source_message_id: Option<MessageId>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let email = normalize_email(email);
        let mut tables = self.tables.lock().await;
        if tables.suppressions.contains_key(&email) {
            return Ok(false);
        }
        tables.suppressions.insert(
            email.clone(),
            Suppression {
                email,
                reason: reason.to_string(),
                source_message_id,
                suppressed_at: at,
            },
        );
        Ok(true)
    }

    async fn is_suppressed(&self, email: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .suppressions
            .contains_key(&normalize_email(email)))
    }

    async fn get(&self, email: &str) -> Result<Option<Suppression>> {
        Ok(self
            .tables
            .lock()
            .await
            .suppressions
            .get(&normalize_email(email))
            .cloned())
    }
}

#[async_trait]
impl ReviewTaskRepository for MemoryStore {
    async fn create(&self, input: NewReviewTask, at: DateTime<Utc>) -> Result<Option<ReviewTask>> {
        let mut tables = self.tables.lock().await;
        if tables
            .tasks
            .iter()
            .any(|t| t.idempotency_key == input.idempotency_key)
        {
            return Ok(None);
        }

        let task = ReviewTask {
            id: Uuid::now_v7(),
            kind: input.kind.to_string(),
            related_id: input.related_id,
            priority: input.priority,
            notes: input.notes,
            idempotency_key: input.idempotency_key,
            created_at: at,
        };
        tables.tasks.push(task.clone());
        Ok(Some(task))
    }

    async fn list_for_related(&self, related_id: Uuid) -> Result<Vec<ReviewTask>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tasks
            .iter()
            .filter(|t| t.related_id == related_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use outreach_common::types::{BounceSeverity, EventKind, TaskKind};
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn new_message(email: &str) -> NewOutreachMessage {
        NewOutreachMessage {
            campaign_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            recipient_email: email.to_string(),
            account_id: "grant-a".to_string(),
            subject: "Quick question".to_string(),
            body: "Hi there".to_string(),
        }
    }

    fn event(id: &str, kind: EventKind, message_ref: MessageRef) -> NewInboundEvent {
        NewInboundEvent {
            provider_event_id: id.to_string(),
            provider: "test".to_string(),
            kind,
            occurred_at: t0(),
            message_ref,
            bounce_severity: None,
            id_synthesized: false,
            payload: serde_json::json!({}),
        }
    }

    fn by_message_id(pmid: &str) -> MessageRef {
        MessageRef {
            provider_message_id: Some(pmid.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_ingest_records_once() {
        let store = MemoryStore::new();
        let message = MessageRepository::create(&store, new_message("lead@example.com"), t0())
            .await
            .unwrap();
        store.set_provider_ids(message.id, Some("pm-1"), None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .ingest(event("evt_1", EventKind::Opened, by_message_id("pm-1")), t0(), t0())
                    .await
                    .unwrap()
            }));
        }

        let mut recorded = 0;
        for handle in handles {
            if let IngestOutcome::Recorded { .. } = handle.await.unwrap() {
                recorded += 1;
            }
        }

        assert_eq!(recorded, 1);
        assert_eq!(store.events().await.len(), 1);
        let message = MessageRepository::get(&store, message.id).await.unwrap().unwrap();
        assert_eq!(message.open_count, 1);
    }

    #[tokio::test]
    async fn test_ingest_resolution_order() {
        let store = MemoryStore::new();
        let older = MessageRepository::create(&store, new_message("Lead@Example.com"), t0())
            .await
            .unwrap();
        let newer = MessageRepository::create(
            &store,
            new_message("lead@example.com"),
            t0() + Duration::minutes(5),
        )
        .await
        .unwrap();
        store.set_provider_ids(older.id, Some("pm-old"), Some("th-old")).await.unwrap();

        // Thread id wins over recipient email
        let outcome = store
            .ingest(
                event(
                    "evt_thread",
                    EventKind::Opened,
                    MessageRef {
                        provider_thread_id: Some("th-old".to_string()),
                        recipient_email: Some("lead@example.com".to_string()),
                        ..Default::default()
                    },
                ),
                t0(),
                t0() - Duration::days(30),
            )
            .await
            .unwrap();
        match outcome {
            IngestOutcome::Recorded { message, .. } => assert_eq!(message.unwrap().id, older.id),
            IngestOutcome::Duplicate => panic!("expected a recorded event"),
        }

        // Email alone picks the most recent message inside the lookback
        let outcome = store
            .ingest(
                event(
                    "evt_email",
                    EventKind::Opened,
                    MessageRef {
                        recipient_email: Some("LEAD@example.com ".to_string()),
                        ..Default::default()
                    },
                ),
                t0(),
                t0() - Duration::days(30),
            )
            .await
            .unwrap();
        match outcome {
            IngestOutcome::Recorded { message, .. } => assert_eq!(message.unwrap().id, newer.id),
            IngestOutcome::Duplicate => panic!("expected a recorded event"),
        }

        // Outside the lookback the event is stored unlinked
        let outcome = store
            .ingest(
                event(
                    "evt_stale",
                    EventKind::Opened,
                    MessageRef {
                        recipient_email: Some("lead@example.com".to_string()),
                        ..Default::default()
                    },
                ),
                t0(),
                t0() + Duration::days(1),
            )
            .await
            .unwrap();
        match outcome {
            IngestOutcome::Recorded { event, message, .. } => {
                assert!(message.is_none());
                assert!(event.message_id.is_none());
            }
            IngestOutcome::Duplicate => panic!("expected a recorded event"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_try_record_never_exceeds_limit() {
        let store = MemoryStore::new();
        let limits = AccountLimits {
            daily_limit: 700,
            hourly_limit: 50,
        };

        let mut handles = Vec::new();
        for _ in 0..80 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_record("grant-a", limits, t0()).await.unwrap().recorded
            }));
        }

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                recorded += 1;
            }
        }

        assert_eq!(recorded, 50);
        let counter = RateCounterRepository::get(&store, "grant-a").await.unwrap().unwrap();
        assert_eq!(counter.hourly_count, 50);
        assert_eq!(counter.daily_count, 50);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_message() {
        let store = MemoryStore::new();
        let message = MessageRepository::create(&store, new_message("lead@example.com"), t0())
            .await
            .unwrap();
        let input = NewQueueItem {
            message_id: message.id,
            account_id: "grant-a".to_string(),
            scheduled_for: t0(),
            priority: 0,
            max_attempts: 3,
        };

        let first = store.enqueue(input.clone(), t0()).await.unwrap();
        let second = store.enqueue(input, t0()).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.item.id, second.item.id);
        let message = MessageRepository::get(&store, message.id).await.unwrap().unwrap();
        assert_eq!(message.state_enum().unwrap(), MessageState::Queued);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_message_fails() {
        let store = MemoryStore::new();
        let result = store
            .enqueue(
                NewQueueItem {
                    message_id: Uuid::new_v4(),
                    account_id: "grant-a".to_string(),
                    scheduled_for: t0(),
                    priority: 0,
                    max_attempts: 3,
                },
                t0(),
            )
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_due_orders_by_priority_then_schedule() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for (priority, offset) in [(0, 0), (5, 10), (5, 1)] {
            let message = MessageRepository::create(&store, new_message("x@example.com"), t0())
                .await
                .unwrap();
            let outcome = store
                .enqueue(
                    NewQueueItem {
                        message_id: message.id,
                        account_id: "grant-a".to_string(),
                        scheduled_for: t0() + Duration::seconds(offset),
                        priority,
                        max_attempts: 3,
                    },
                    t0(),
                )
                .await
                .unwrap();
            ids.push(outcome.item.id);
        }

        let due = store.due(t0() + Duration::minutes(1), 10).await.unwrap();
        let order: Vec<QueueItemId> = due.iter().map(|i| i.id).collect();
        assert_eq!(order, vec![ids[2], ids[1], ids[0]]);

        // A claimed item is not due and cannot be claimed twice
        assert!(store.claim(ids[2], t0()).await.unwrap().is_some());
        assert!(store.claim(ids[2], t0()).await.unwrap().is_none());
        assert_eq!(store.due(t0() + Duration::minutes(1), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_pending_for_recipient() {
        let store = MemoryStore::new();
        let bounced = MessageRepository::create(&store, new_message("gone@example.com"), t0())
            .await
            .unwrap();
        let other = MessageRepository::create(&store, new_message("gone@example.com"), t0())
            .await
            .unwrap();
        for id in [bounced.id, other.id] {
            store
                .enqueue(
                    NewQueueItem {
                        message_id: id,
                        account_id: "grant-a".to_string(),
                        scheduled_for: t0(),
                        priority: 0,
                        max_attempts: 3,
                    },
                    t0(),
                )
                .await
                .unwrap();
        }

        let cancelled = store
            .cancel_pending_for_recipient("Gone@example.com", Some(bounced.id), t0())
            .await
            .unwrap();
        assert_eq!(cancelled, vec![other.id]);

        let other = MessageRepository::get(&store, other.id).await.unwrap().unwrap();
        assert_eq!(other.state_enum().unwrap(), MessageState::Cancelled);
        let items = QueueRepository::list_for_message(&store, bounced.id).await.unwrap();
        assert_eq!(items[0].status, "pending");
    }

    #[tokio::test]
    async fn test_release_stale_claims() {
        let store = MemoryStore::new();
        let message = MessageRepository::create(&store, new_message("lead@example.com"), t0())
            .await
            .unwrap();
        let item = store
            .enqueue(
                NewQueueItem {
                    message_id: message.id,
                    account_id: "grant-a".to_string(),
                    scheduled_for: t0(),
                    priority: 0,
                    max_attempts: 3,
                },
                t0(),
            )
            .await
            .unwrap()
            .item;
        store.claim(item.id, t0()).await.unwrap();

        assert_eq!(store.release_stale_claims(t0(), t0()).await.unwrap(), 0);
        let later = t0() + Duration::minutes(11);
        assert_eq!(
            store
                .release_stale_claims(later - Duration::minutes(10), later)
                .await
                .unwrap(),
            1
        );
        let item = QueueRepository::get(&store, item.id).await.unwrap().unwrap();
        assert_eq!(item.status, "pending");
        assert_eq!(item.attempts, 0);
    }

    #[tokio::test]
    async fn test_cancel_leaves_claimed_items_to_the_sender() {
        let store = MemoryStore::new();
        let mut items = Vec::new();
        for _ in 0..2 {
            let message = MessageRepository::create(&store, new_message("lead@example.com"), t0())
                .await
                .unwrap();
            let item = store
                .enqueue(
                    NewQueueItem {
                        message_id: message.id,
                        account_id: "grant-a".to_string(),
                        scheduled_for: t0(),
                        priority: 0,
                        max_attempts: 3,
                    },
                    t0(),
                )
                .await
                .unwrap()
                .item;
            items.push(item.id);
        }
        let (pending, in_flight) = (items[0], items[1]);
        store.claim(in_flight, t0()).await.unwrap();

        assert!(store.cancel(pending, t0()).await.unwrap());
        assert!(!store.cancel(pending, t0()).await.unwrap());
        assert!(!store.cancel(in_flight, t0()).await.unwrap());

        // The in-flight send still concludes normally
        store.mark_sent(in_flight, 1, t0()).await.unwrap();
        let item = QueueRepository::get(&store, in_flight).await.unwrap().unwrap();
        assert_eq!(item.status, "sent");

        // Only a claimed item can be abandoned
        assert!(matches!(
            store.abandon(pending, t0()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_review_task_idempotency_and_suppression() {
        let store = MemoryStore::new();
        let related = Uuid::new_v4();
        let task = || NewReviewTask {
            kind: TaskKind::UnclassifiedReply,
            related_id: related,
            priority: 1,
            notes: "Reply needs a human".to_string(),
            idempotency_key: "unclassified_reply:evt_9".to_string(),
        };

        assert!(ReviewTaskRepository::create(&store, task(), t0()).await.unwrap().is_some());
        assert!(ReviewTaskRepository::create(&store, task(), t0()).await.unwrap().is_none());
        assert_eq!(store.list_for_related(related).await.unwrap().len(), 1);

        assert!(store
            .suppress("Gone@Example.com", &BounceSeverity::Hard.to_string(), None, t0())
            .await
            .unwrap());
        assert!(!store.suppress("gone@example.com", "hard", None, t0()).await.unwrap());
        assert!(store.is_suppressed("GONE@example.com").await.unwrap());
    }
}
