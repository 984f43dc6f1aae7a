//! Event Processor - Deduplicated intake of provider webhook events

use super::dedup::DedupCache;
use super::normalize::{normalize, WebhookPayload};
use crate::automation::{AutomationAction, AutomationDispatcher};
use crate::metrics::CoreMetrics;
use chrono::Duration;
use outreach_common::types::MessageId;
use outreach_common::{Clock, Error, Result, Transition};
use outreach_storage::models::IngestOutcome;
use outreach_storage::repository::EventRepository;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of processing one webhook delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub accepted: bool,
    pub duplicate: bool,
    pub message_id: Option<MessageId>,
    /// Provider event id, native or synthesized
    pub event_id: String,
    #[serde(skip)]
    pub transition: Option<Transition>,
    #[serde(skip)]
    pub actions: Vec<AutomationAction>,
}

impl ProcessOutcome {
    fn duplicate(event_id: String) -> Self {
        Self {
            accepted: true,
            duplicate: true,
            message_id: None,
            event_id,
            transition: None,
            actions: Vec::new(),
        }
    }
}

/// Event Processor
pub struct EventProcessor {
    events: Arc<dyn EventRepository>,
    dispatcher: Arc<AutomationDispatcher>,
    cache: DedupCache,
    clock: Arc<dyn Clock>,
    metrics: Arc<CoreMetrics>,
    recipient_lookback: Duration,
}

impl EventProcessor {
    /// Create a new event processor
    pub fn new(
        events: Arc<dyn EventRepository>,
        dispatcher: Arc<AutomationDispatcher>,
        clock: Arc<dyn Clock>,
        metrics: Arc<CoreMetrics>,
        dedup_cache_size: usize,
        recipient_lookback_days: i64,
    ) -> Self {
        Self {
            events,
            dispatcher,
            cache: DedupCache::new(dedup_cache_size),
            clock,
            metrics,
            recipient_lookback: Duration::days(recipient_lookback_days),
        }
    }

    /// Process a raw webhook body
    pub async fn process_event(&self, raw: serde_json::Value) -> Result<ProcessOutcome> {
        let payload: WebhookPayload = match serde_json::from_value(raw.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, payload = %raw, "Rejecting malformed webhook payload");
                self.metrics.event("malformed");
                return Err(Error::Malformed(e.to_string()));
            }
        };
        self.process(&payload).await
    }

    /// Process an already parsed webhook body
    pub async fn process(&self, payload: &WebhookPayload) -> Result<ProcessOutcome> {
        let now = self.clock.now();
        let event = match normalize(payload, now) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, event_type = %payload.event_type, "Rejecting malformed event");
                self.metrics.event("malformed");
                return Err(e);
            }
        };
        let event_id = event.provider_event_id.clone();

        if self.cache.contains(&event_id).await {
            debug!(event_id = %event_id, "Duplicate event (cached)");
            self.metrics.event("duplicate");
            return Ok(ProcessOutcome::duplicate(event_id));
        }

        let outcome = self
            .events
            .ingest(event, now, now - self.recipient_lookback)
            .await?;
        self.cache.insert(&event_id).await;

        let (event, message, transition) = match outcome {
            IngestOutcome::Duplicate => {
                debug!(event_id = %event_id, "Duplicate event");
                self.metrics.event("duplicate");
                return Ok(ProcessOutcome::duplicate(event_id));
            }
            IngestOutcome::Recorded {
                event,
                message,
                transition,
            } => (event, message, transition),
        };

        let Some(message) = message else {
            info!(
                event_id = %event_id,
                event_type = %event.event_type,
                "Event recorded without a matching message"
            );
            self.metrics.event("unresolved");
            return Ok(ProcessOutcome {
                accepted: true,
                duplicate: false,
                message_id: None,
                event_id,
                transition: None,
                actions: Vec::new(),
            });
        };

        self.metrics.event("accepted");
        if let Some(t) = transition.filter(|t| t.state_changed()) {
            info!(
                message_id = %message.id,
                event_id = %event_id,
                from = %t.from,
                to = %t.to,
                "Message state advanced"
            );
            self.metrics.transition(t.to.as_str());
        }

        // Dispatch errors are only logged and counted. A redelivery of this event
        // is a duplicate and never reaches here, so they are not retried.
        let actions = self.dispatcher.dispatch(&event, &message).await;

        Ok(ProcessOutcome {
            accepted: true,
            duplicate: false,
            message_id: Some(message.id),
            event_id,
            transition,
            actions,
        })
    }

    /// Forget every cached event id
    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }
}
