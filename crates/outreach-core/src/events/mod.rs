//! Inbound events - Normalization, dedup and processing of provider webhooks

mod dedup;
mod normalize;
mod processor;

pub use dedup::DedupCache;
pub use normalize::{normalize, WebhookPayload};
pub use processor::{EventProcessor, ProcessOutcome};
