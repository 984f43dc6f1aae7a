//! Repository layer for data access

pub mod events;
pub mod messages;
pub mod rate_counters;
pub mod review_tasks;
pub mod send_queue;
pub mod suppressions;

pub use events::{DbEventRepository, EventRepository};
pub use messages::{DbMessageRepository, MessageRepository};
pub use rate_counters::{DbRateCounterRepository, RateCounterRepository};
pub use review_tasks::{DbReviewTaskRepository, ReviewTaskRepository};
pub use send_queue::{DbQueueRepository, QueueRepository};
pub use suppressions::{DbSuppressionRepository, SuppressionRepository};
