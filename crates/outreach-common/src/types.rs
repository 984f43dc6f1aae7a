//! Common types for the outreach core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for outreach messages
pub type MessageId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for recipients
pub type RecipientId = Uuid;

/// Unique identifier for send queue items
pub type QueueItemId = Uuid;

/// Sending account / grant identifier (opaque, provider assigned)
pub type AccountId = String;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Normalized inbound event type.
///
/// Providers map their own vocabulary onto this closed set at the intake
/// boundary; see [`EventKind::from_provider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Opened,
    LinkClicked,
    Bounced,
    Replied,
    SendSucceeded,
    SendFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Created,
        EventKind::Opened,
        EventKind::LinkClicked,
        EventKind::Bounced,
        EventKind::Replied,
        EventKind::SendSucceeded,
        EventKind::SendFailed,
    ];

    /// Map a provider event name onto the canonical set (case-insensitive)
    pub fn from_provider(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        let kind = match name.as_str() {
            "created" | "message.created" => EventKind::Created,
            "opened" | "open" | "message.opened" => EventKind::Opened,
            "link_clicked" | "click" | "clicked" | "message.link_clicked" => {
                EventKind::LinkClicked
            }
            "bounced" | "bounce" | "message.bounced" | "message.bounce_detected" => {
                EventKind::Bounced
            }
            "replied" | "reply" | "thread.replied" | "message.replied" => EventKind::Replied,
            "send_succeeded" | "delivered" | "message.send_success" => EventKind::SendSucceeded,
            "send_failed" | "message.send_failed" => EventKind::SendFailed,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Opened => "opened",
            EventKind::LinkClicked => "link_clicked",
            EventKind::Bounced => "bounced",
            EventKind::Replied => "replied",
            EventKind::SendSucceeded => "send_succeeded",
            EventKind::SendFailed => "send_failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Invalid event kind: {}", s))
    }
}

/// Lifecycle state of an outreach message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Draft,
    Queued,
    Sent,
    Opened,
    Clicked,
    Replied,
    Booked,
    Bounced,
    Failed,
    Cancelled,
    Rejected,
}

impl MessageState {
    /// Position in the high-water-mark order, `None` for side branches
    pub fn rank(&self) -> Option<u8> {
        match self {
            MessageState::Draft => Some(0),
            MessageState::Queued => Some(1),
            MessageState::Sent => Some(2),
            MessageState::Opened => Some(3),
            MessageState::Clicked => Some(4),
            MessageState::Replied => Some(5),
            MessageState::Booked => Some(6),
            MessageState::Bounced
            | MessageState::Failed
            | MessageState::Cancelled
            | MessageState::Rejected => None,
        }
    }

    /// Side branches off the main order
    pub fn is_absorbing(&self) -> bool {
        self.rank().is_none()
    }

    /// No signal changes a terminal message, derived fields included
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageState::Booked | MessageState::Rejected | MessageState::Cancelled
        )
    }

    /// Strictly below `other` in the main order (false for side branches)
    pub fn is_below(&self, other: MessageState) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Draft => "draft",
            MessageState::Queued => "queued",
            MessageState::Sent => "sent",
            MessageState::Opened => "opened",
            MessageState::Clicked => "clicked",
            MessageState::Replied => "replied",
            MessageState::Booked => "booked",
            MessageState::Bounced => "bounced",
            MessageState::Failed => "failed",
            MessageState::Cancelled => "cancelled",
            MessageState::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(MessageState::Draft),
            "queued" => Ok(MessageState::Queued),
            "sent" => Ok(MessageState::Sent),
            "opened" => Ok(MessageState::Opened),
            "clicked" => Ok(MessageState::Clicked),
            "replied" => Ok(MessageState::Replied),
            "booked" => Ok(MessageState::Booked),
            "bounced" => Ok(MessageState::Bounced),
            "failed" => Ok(MessageState::Failed),
            "cancelled" => Ok(MessageState::Cancelled),
            "rejected" => Ok(MessageState::Rejected),
            _ => Err(format!("Invalid message state: {}", s)),
        }
    }
}

/// Send status of an outreach message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Queued,
    Sent,
    Failed,
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendStatus::Pending => write!(f, "pending"),
            SendStatus::Queued => write!(f, "queued"),
            SendStatus::Sent => write!(f, "sent"),
            SendStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SendStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SendStatus::Pending),
            "queued" => Ok(SendStatus::Queued),
            "sent" => Ok(SendStatus::Sent),
            "failed" => Ok(SendStatus::Failed),
            _ => Err(format!("Invalid send status: {}", s)),
        }
    }
}

/// Send queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::Sent | QueueItemStatus::Failed | QueueItemStatus::Cancelled
        )
    }
}

impl std::fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueItemStatus::Pending => write!(f, "pending"),
            QueueItemStatus::Processing => write!(f, "processing"),
            QueueItemStatus::Sent => write!(f, "sent"),
            QueueItemStatus::Failed => write!(f, "failed"),
            QueueItemStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for QueueItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "processing" => Ok(QueueItemStatus::Processing),
            "sent" => Ok(QueueItemStatus::Sent),
            "failed" => Ok(QueueItemStatus::Failed),
            "cancelled" => Ok(QueueItemStatus::Cancelled),
            _ => Err(format!("Invalid queue item status: {}", s)),
        }
    }
}

/// Bounce severity reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceSeverity {
    Hard,
    Soft,
}

impl BounceSeverity {
    /// Parse provider bounce labels ("hard", "permanent", "soft", "transient", ...)
    pub fn from_provider(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "hard" | "permanent" | "hard_bounce" => Some(BounceSeverity::Hard),
            "soft" | "transient" | "temporary" | "soft_bounce" => Some(BounceSeverity::Soft),
            _ => None,
        }
    }
}

impl std::fmt::Display for BounceSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BounceSeverity::Hard => write!(f, "hard"),
            BounceSeverity::Soft => write!(f, "soft"),
        }
    }
}

impl std::str::FromStr for BounceSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_provider(s).ok_or_else(|| format!("Invalid bounce severity: {}", s))
    }
}

/// Kind of human-review task raised by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    UnclassifiedReply,
    BookingFollowUp,
    SendFailed,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::UnclassifiedReply => write!(f, "unclassified_reply"),
            TaskKind::BookingFollowUp => write!(f, "booking_follow_up"),
            TaskKind::SendFailed => write!(f, "send_failed"),
        }
    }
}

/// Lowercase and trim an email address for matching
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_provider_aliases() {
        assert_eq!(EventKind::from_provider("message.opened"), Some(EventKind::Opened));
        assert_eq!(EventKind::from_provider("CLICK"), Some(EventKind::LinkClicked));
        assert_eq!(EventKind::from_provider("thread.replied"), Some(EventKind::Replied));
        assert_eq!(EventKind::from_provider("delivered"), Some(EventKind::SendSucceeded));
        assert_eq!(EventKind::from_provider("unsubscribed"), None);
    }

    #[test]
    fn test_event_kind_display_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.to_string().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_state_order() {
        assert!(MessageState::Queued.is_below(MessageState::Sent));
        assert!(MessageState::Clicked.is_below(MessageState::Replied));
        assert!(!MessageState::Replied.is_below(MessageState::Opened));
        assert!(!MessageState::Bounced.is_below(MessageState::Opened));
        assert!(MessageState::Bounced.is_absorbing());
        assert!(MessageState::Booked.is_terminal());
        assert!(!MessageState::Bounced.is_terminal());
    }

    #[test]
    fn test_bounce_severity_labels() {
        assert_eq!(BounceSeverity::from_provider("Permanent"), Some(BounceSeverity::Hard));
        assert_eq!(BounceSeverity::from_provider("soft"), Some(BounceSeverity::Soft));
        assert_eq!(BounceSeverity::from_provider("weird"), None);
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Jane@Example.COM "), "jane@example.com");
    }
}
