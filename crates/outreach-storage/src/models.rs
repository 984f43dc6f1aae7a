//! Database models

use chrono::{DateTime, Duration, Utc};
use outreach_common::config::AccountLimits;
use outreach_common::types::{
    AccountId, BounceSeverity, CampaignId, EventKind, MessageId, MessageState, QueueItemId,
    QueueItemStatus, RecipientId, SendStatus, TaskKind,
};
use outreach_common::{Error, MessageLifecycle, Result, Signal, Transition};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Outreach message model
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct OutreachMessage {
    pub id: MessageId,
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub recipient_email: String,
    pub account_id: AccountId,
    pub subject: String,
    pub body: String,
    pub state: String,
    pub send_status: String,
    pub provider_message_id: Option<String>,
    pub provider_thread_id: Option<String>,
    pub open_count: i32,
    pub click_count: i32,
    pub sent_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutreachMessage {
    /// Get state enum
    pub fn state_enum(&self) -> Result<MessageState> {
        self.state.parse().map_err(Error::Internal)
    }

    /// Get send status enum
    pub fn send_status_enum(&self) -> Result<SendStatus> {
        self.send_status.parse().map_err(Error::Internal)
    }

    /// Lifecycle view of the row
    pub fn lifecycle(&self) -> Result<MessageLifecycle> {
        Ok(MessageLifecycle {
            state: self.state_enum()?,
            open_count: self.open_count,
            click_count: self.click_count,
            sent_at: self.sent_at,
            opened_at: self.opened_at,
            clicked_at: self.clicked_at,
            replied_at: self.replied_at,
            bounced_at: self.bounced_at,
            failed_at: self.failed_at,
        })
    }

    fn set_lifecycle(&mut self, lc: MessageLifecycle) {
        self.state = lc.state.to_string();
        self.open_count = lc.open_count;
        self.click_count = lc.click_count;
        self.sent_at = lc.sent_at;
        self.opened_at = lc.opened_at;
        self.clicked_at = lc.clicked_at;
        self.replied_at = lc.replied_at;
        self.bounced_at = lc.bounced_at;
        self.failed_at = lc.failed_at;
    }

    /// Run a signal through the state machine and fold the result into the row.
    ///
    /// `send_status` follows the lifecycle: queueing marks it `queued`, a
    /// provider success marks it `sent` and a send failure marks it `failed`.
    pub fn absorb(&mut self, signal: Signal, at: DateTime<Utc>) -> Result<Transition> {
        let mut lc = self.lifecycle()?;
        let transition = lc.apply(signal, at);
        if !transition.changed {
            return Ok(transition);
        }

        self.set_lifecycle(lc);
        match signal {
            Signal::Queued => self.send_status = SendStatus::Queued.to_string(),
            Signal::Event(EventKind::SendSucceeded) => {
                self.send_status = SendStatus::Sent.to_string()
            }
            Signal::Event(EventKind::SendFailed) => {
                self.send_status = SendStatus::Failed.to_string()
            }
            _ => {}
        }
        self.updated_at = at;
        Ok(transition)
    }
}

/// Create outreach message input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutreachMessage {
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub recipient_email: String,
    pub account_id: AccountId,
    pub subject: String,
    pub body: String,
}

/// How an inbound event points at the message it concerns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub provider_thread_id: Option<String>,
    #[serde(default)]
    pub recipient_email: Option<String>,
}

impl MessageRef {
    pub fn is_empty(&self) -> bool {
        self.provider_message_id.is_none()
            && self.provider_thread_id.is_none()
            && self.recipient_email.is_none()
    }
}

/// Stored inbound event
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: uuid::Uuid,
    pub provider_event_id: String,
    pub provider: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub message_id: Option<MessageId>,
    pub bounce_severity: Option<String>,
    pub id_synthesized: bool,
    pub payload: serde_json::Value,
    pub is_duplicate: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Get event kind enum
    pub fn kind(&self) -> Result<EventKind> {
        self.event_type.parse().map_err(Error::Internal)
    }

    /// Get bounce severity enum
    pub fn bounce_severity_enum(&self) -> Option<BounceSeverity> {
        self.bounce_severity.as_deref().and_then(BounceSeverity::from_provider)
    }
}

/// Normalized event ready to be recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInboundEvent {
    pub provider_event_id: String,
    pub provider: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub message_ref: MessageRef,
    pub bounce_severity: Option<BounceSeverity>,
    pub id_synthesized: bool,
    pub payload: serde_json::Value,
}

impl NewInboundEvent {
    /// Row as it is stored, before message resolution
    pub fn into_row(self, received_at: DateTime<Utc>) -> InboundEvent {
        InboundEvent {
            id: uuid::Uuid::now_v7(),
            provider_event_id: self.provider_event_id,
            provider: self.provider,
            event_type: self.kind.to_string(),
            occurred_at: self.occurred_at,
            message_id: None,
            bounce_severity: self.bounce_severity.map(|s| s.to_string()),
            id_synthesized: self.id_synthesized,
            payload: self.payload,
            is_duplicate: false,
            received_at,
        }
    }
}

/// Result of recording an inbound event
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// The provider event id was already recorded; nothing changed
    Duplicate,
    /// First sighting: the event is stored and any transition is applied
    Recorded {
        event: InboundEvent,
        /// Message after the transition, if one could be resolved
        message: Option<OutreachMessage>,
        transition: Option<Transition>,
    },
}

/// Send queue item model
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SendQueueItem {
    pub id: QueueItemId,
    pub message_id: MessageId,
    pub account_id: AccountId,
    pub scheduled_for: DateTime<Utc>,
    pub priority: i16,
    pub attempts: i32,
    pub max_attempts: i32,
    pub status: String,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SendQueueItem {
    /// Get status enum
    pub fn status_enum(&self) -> Result<QueueItemStatus> {
        self.status.parse().map_err(Error::Internal)
    }

    /// Whether another failed attempt is still allowed
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Create send queue item input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub message_id: MessageId,
    pub account_id: AccountId,
    pub scheduled_for: DateTime<Utc>,
    pub priority: i16,
    pub max_attempts: i32,
}

/// Result of an enqueue call
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub item: SendQueueItem,
    /// False when an active item for the message already existed
    pub created: bool,
}

/// Per-account rolling rate counter
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct AccountRateCounter {
    pub account_id: AccountId,
    pub daily_count: i32,
    pub hourly_count: i32,
    pub daily_limit: i32,
    pub hourly_limit: i32,
    pub daily_reset_at: DateTime<Utc>,
    pub hourly_reset_at: DateTime<Utc>,
    pub total_sent_lifetime: i64,
    pub last_send_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AccountRateCounter {
    pub fn hour() -> Duration {
        Duration::hours(1)
    }

    pub fn day() -> Duration {
        Duration::hours(24)
    }

    /// Counter as created lazily on first use
    pub fn fresh(account_id: &str, limits: AccountLimits, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.to_string(),
            daily_count: 0,
            hourly_count: 0,
            daily_limit: limits.daily_limit,
            hourly_limit: limits.hourly_limit,
            daily_reset_at: now + Self::day(),
            hourly_reset_at: now + Self::hour(),
            total_sent_lifetime: 0,
            last_send_at: None,
            updated_at: now,
        }
    }

    /// Reset every window whose boundary `now` has crossed.
    ///
    /// Returns whether anything was reset. Calling it again inside the new
    /// window is a no-op.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        let mut rolled = false;
        if now >= self.hourly_reset_at {
            self.hourly_count = 0;
            self.hourly_reset_at = now + Self::hour();
            rolled = true;
        }
        if now >= self.daily_reset_at {
            self.daily_count = 0;
            self.daily_reset_at = now + Self::day();
            rolled = true;
        }
        if rolled {
            self.updated_at = now;
        }
        rolled
    }

    pub fn hourly_exhausted(&self) -> bool {
        self.hourly_count >= self.hourly_limit
    }

    pub fn daily_exhausted(&self) -> bool {
        self.daily_count >= self.daily_limit
    }

    /// Room for one more send in both windows (assumes windows are current)
    pub fn has_headroom(&self) -> bool {
        !self.hourly_exhausted() && !self.daily_exhausted()
    }

    /// Earliest time a send can be recorded (assumes windows are current)
    pub fn next_available_slot(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.hourly_exhausted(), self.daily_exhausted()) {
            (false, false) => now,
            (true, false) => self.hourly_reset_at,
            (false, true) => self.daily_reset_at,
            (true, true) => self.hourly_reset_at.max(self.daily_reset_at),
        }
    }

    /// Roll windows forward, then count one send if both limits allow it
    pub fn try_record(&mut self, now: DateTime<Utc>) -> bool {
        self.roll_over(now);
        if self.hourly_count + 1 > self.hourly_limit || self.daily_count + 1 > self.daily_limit {
            return false;
        }
        self.hourly_count += 1;
        self.daily_count += 1;
        self.total_sent_lifetime += 1;
        self.last_send_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Undo one send recorded while `reserved` was current.
    ///
    /// Windows that have rolled over since are left alone.
    pub fn release(&mut self, reserved: &AccountRateCounter, now: DateTime<Utc>) {
        if self.hourly_reset_at == reserved.hourly_reset_at {
            self.hourly_count = (self.hourly_count - 1).max(0);
        }
        if self.daily_reset_at == reserved.daily_reset_at {
            self.daily_count = (self.daily_count - 1).max(0);
        }
        self.total_sent_lifetime = (self.total_sent_lifetime - 1).max(0);
        self.updated_at = now;
    }

    /// Remaining sends in each window
    pub fn remaining(&self) -> RemainingQuota {
        RemainingQuota {
            per_hour: (self.hourly_limit - self.hourly_count).max(0),
            per_day: (self.daily_limit - self.daily_count).max(0),
        }
    }
}

/// Remaining quota for an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingQuota {
    pub per_hour: i32,
    pub per_day: i32,
}

/// Result of a conditional counter increment
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub recorded: bool,
    /// Counter after the call (windows rolled over, increment applied if recorded)
    pub counter: AccountRateCounter,
}

/// Suppressed contact model
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Suppression {
    pub email: String,
    pub reason: String,
    pub source_message_id: Option<MessageId>,
    pub suppressed_at: DateTime<Utc>,
}

/// Review task model
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ReviewTask {
    pub id: uuid::Uuid,
    pub kind: String,
    pub related_id: uuid::Uuid,
    pub priority: i16,
    pub notes: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// Create review task input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReviewTask {
    pub kind: TaskKind,
    pub related_id: uuid::Uuid,
    pub priority: i16,
    pub notes: String,
    pub idempotency_key: String,
}
