//! Automation - Rules fired by message lifecycle events

pub mod classifier;
pub mod dispatcher;

pub use classifier::{ReplyClassifier, ReplyIntent, ReplyRule, RuleBasedReplyClassifier};
pub use dispatcher::{AutomationAction, AutomationDispatcher};
