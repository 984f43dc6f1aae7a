//! Outreach Core - Event intake, send scheduling and automation
//!
//! This crate provides the webhook event processor, the send scheduler with
//! per-account rate limits, the automation dispatcher and the delivery
//! gateway client.

pub mod automation;
pub mod events;
pub mod gateway;
pub mod metrics;
pub mod scheduled;
pub mod service;

pub use automation::{
    AutomationAction, AutomationDispatcher, ReplyClassifier, ReplyIntent, ReplyRule,
    RuleBasedReplyClassifier,
};
pub use events::{EventProcessor, ProcessOutcome, WebhookPayload};
pub use gateway::{DeliveryGateway, GatewayError, HttpGateway, OutboundEmail, SendReceipt};
pub use metrics::CoreMetrics;
pub use scheduled::{BatchReport, RateLimiter, SendRequest, SendScheduler};
pub use service::{OutreachCore, Repositories};
