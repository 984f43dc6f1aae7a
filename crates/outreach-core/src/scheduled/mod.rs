//! Scheduled sending - Queue processing and per-account rate limits

mod rate_limiter;
mod scheduler;

pub use rate_limiter::{RateLimiter, Reservation};
pub use scheduler::{BatchReport, SendRequest, SendScheduler};
