//! Outreach Common - Shared types and utilities
//!
//! This crate provides the identifiers, enums, lifecycle state machine,
//! clock and configuration shared by every outreach component.

pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::{MessageLifecycle, Signal, Transition};
