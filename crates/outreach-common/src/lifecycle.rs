//! Outreach message lifecycle.
//!
//! The `state` of a message is a high-water mark over
//! `draft < queued < sent < opened < clicked < replied < booked`, with
//! `bounced`, `failed`, `cancelled` and `rejected` as side branches.
//! Engagement counters and transition timestamps are cumulative facts and are
//! tracked independently of the state.
//!
//! Everything in here is pure. Storage backends load a [`MessageLifecycle`],
//! call [`MessageLifecycle::apply`] while holding the row, and persist the
//! result only when [`Transition::changed`] is set.

use crate::types::{EventKind, MessageState, Timestamp};
use serde::{Deserialize, Serialize};

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// A send was requested for the message
    Queued,
    /// A normalized provider event
    Event(EventKind),
    /// The reply was classified as a booking
    Booked,
    /// The reply was classified as a rejection
    Rejected,
    /// The pending send was withdrawn
    Cancelled,
}

impl From<EventKind> for Signal {
    fn from(kind: EventKind) -> Self {
        Signal::Event(kind)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Queued => write!(f, "queued"),
            Signal::Event(kind) => write!(f, "{}", kind),
            Signal::Booked => write!(f, "booked"),
            Signal::Rejected => write!(f, "rejected"),
            Signal::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle-relevant fields of an outreach message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLifecycle {
    pub state: MessageState,
    pub open_count: i32,
    pub click_count: i32,
    pub sent_at: Option<Timestamp>,
    pub opened_at: Option<Timestamp>,
    pub clicked_at: Option<Timestamp>,
    pub replied_at: Option<Timestamp>,
    pub bounced_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
}

/// Result of applying a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub signal: Signal,
    pub from: MessageState,
    pub to: MessageState,
    /// Any field (state, counter or timestamp) changed
    pub changed: bool,
}

impl Transition {
    pub fn state_changed(&self) -> bool {
        self.from != self.to
    }
}

impl MessageLifecycle {
    /// A fresh message that has not been queued yet
    pub fn new() -> Self {
        Self::with_state(MessageState::Draft)
    }

    pub fn with_state(state: MessageState) -> Self {
        Self {
            state,
            open_count: 0,
            click_count: 0,
            sent_at: None,
            opened_at: None,
            clicked_at: None,
            replied_at: None,
            bounced_at: None,
            failed_at: None,
        }
    }

    /// Apply a signal observed at `at`.
    ///
    /// Terminal messages (`booked`, `rejected`, `cancelled`) are never
    /// modified. `bounced` and `failed` only leave for `replied`.
    pub fn apply(&mut self, signal: Signal, at: Timestamp) -> Transition {
        let before = self.clone();
        let from = self.state;

        if !from.is_terminal() {
            match signal {
                Signal::Queued => {
                    if from == MessageState::Draft {
                        self.state = MessageState::Queued;
                    }
                }
                Signal::Event(EventKind::Created) => {
                    self.advance_to(MessageState::Queued);
                }
                Signal::Event(EventKind::SendSucceeded) => {
                    stamp(&mut self.sent_at, at);
                    self.advance_to(MessageState::Sent);
                }
                Signal::Event(EventKind::SendFailed) => {
                    if from.is_below(MessageState::Opened) {
                        self.state = MessageState::Failed;
                        stamp(&mut self.failed_at, at);
                    }
                }
                Signal::Event(EventKind::Opened) => {
                    self.open_count = self.open_count.saturating_add(1);
                    stamp(&mut self.opened_at, at);
                    self.advance_to(MessageState::Opened);
                }
                Signal::Event(EventKind::LinkClicked) => {
                    self.click_count = self.click_count.saturating_add(1);
                    stamp(&mut self.clicked_at, at);
                    self.advance_to(MessageState::Clicked);
                }
                Signal::Event(EventKind::Bounced) => {
                    // A reply already proved delivery.
                    if from != MessageState::Replied && from != MessageState::Failed {
                        self.state = MessageState::Bounced;
                        stamp(&mut self.bounced_at, at);
                    }
                }
                Signal::Event(EventKind::Replied) => {
                    self.state = MessageState::Replied;
                    stamp(&mut self.replied_at, at);
                }
                Signal::Booked => {
                    if from == MessageState::Replied {
                        self.state = MessageState::Booked;
                    }
                }
                Signal::Rejected => {
                    self.state = MessageState::Rejected;
                }
                Signal::Cancelled => {
                    if from.is_below(MessageState::Opened) {
                        self.state = MessageState::Cancelled;
                    }
                }
            }
        }

        Transition {
            signal,
            from,
            to: self.state,
            changed: *self != before,
        }
    }

    fn advance_to(&mut self, target: MessageState) {
        if self.state.is_below(target) {
            self.state = target;
        }
    }
}

impl Default for MessageLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

fn stamp(slot: &mut Option<Timestamp>, at: Timestamp) {
    if slot.is_none() {
        *slot = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn sent() -> MessageLifecycle {
        let mut lc = MessageLifecycle::with_state(MessageState::Queued);
        lc.apply(EventKind::SendSucceeded.into(), t0());
        lc
    }

    #[test]
    fn test_send_succeeded_is_idempotent() {
        let mut lc = MessageLifecycle::with_state(MessageState::Queued);
        let first = lc.apply(EventKind::SendSucceeded.into(), t0());
        assert!(first.state_changed());
        assert_eq!(lc.sent_at, Some(t0()));

        let second = lc.apply(EventKind::SendSucceeded.into(), t0() + Duration::minutes(5));
        assert!(!second.changed);
        assert_eq!(lc.state, MessageState::Sent);
        assert_eq!(lc.sent_at, Some(t0()));
    }

    #[test]
    fn test_open_counts_accumulate_but_state_is_high_water() {
        let mut lc = sent();
        lc.apply(EventKind::LinkClicked.into(), t0());
        let t = lc.apply(EventKind::Opened.into(), t0() + Duration::minutes(1));

        assert_eq!(lc.state, MessageState::Clicked);
        assert_eq!(lc.open_count, 1);
        assert!(t.changed);
        assert!(!t.state_changed());
    }

    #[test]
    fn test_opened_does_not_leave_bounced() {
        let mut lc = sent();
        lc.apply(EventKind::Bounced.into(), t0());
        lc.apply(EventKind::Opened.into(), t0());

        assert_eq!(lc.state, MessageState::Bounced);
        assert_eq!(lc.open_count, 1);
    }

    #[test]
    fn test_reply_overrides_hard_bounce() {
        let mut lc = sent();
        lc.apply(EventKind::Bounced.into(), t0());
        let t = lc.apply(EventKind::Replied.into(), t0() + Duration::hours(1));

        assert_eq!(t.from, MessageState::Bounced);
        assert_eq!(lc.state, MessageState::Replied);
        assert!(lc.bounced_at.is_some());
        assert!(lc.replied_at.is_some());
    }

    #[test]
    fn test_bounce_after_reply_is_ignored() {
        let mut lc = sent();
        lc.apply(EventKind::Replied.into(), t0());
        let t = lc.apply(EventKind::Bounced.into(), t0());

        assert!(!t.changed);
        assert_eq!(lc.state, MessageState::Replied);
        assert_eq!(lc.bounced_at, None);
    }

    #[test]
    fn test_terminal_states_freeze_everything() {
        let mut lc = sent();
        lc.apply(EventKind::Replied.into(), t0());
        lc.apply(Signal::Booked, t0());
        assert_eq!(lc.state, MessageState::Booked);

        let frozen = lc.clone();
        for kind in EventKind::ALL {
            let t = lc.apply(kind.into(), t0() + Duration::days(1));
            assert!(!t.changed, "{} mutated a booked message", kind);
        }
        assert_eq!(lc, frozen);
    }

    #[test]
    fn test_booked_requires_replied() {
        let mut lc = sent();
        let t = lc.apply(Signal::Booked, t0());
        assert!(!t.changed);
        assert_eq!(lc.state, MessageState::Sent);
    }

    #[test]
    fn test_send_failed_only_before_engagement() {
        let mut lc = MessageLifecycle::with_state(MessageState::Queued);
        lc.apply(EventKind::SendFailed.into(), t0());
        assert_eq!(lc.state, MessageState::Failed);
        assert_eq!(lc.failed_at, Some(t0()));

        let mut engaged = sent();
        engaged.apply(EventKind::Opened.into(), t0());
        engaged.apply(EventKind::SendFailed.into(), t0());
        assert_eq!(engaged.state, MessageState::Opened);
        assert_eq!(engaged.failed_at, None);
    }

    #[test]
    fn test_queued_and_cancelled() {
        let mut lc = MessageLifecycle::new();
        assert!(lc.apply(Signal::Queued, t0()).state_changed());
        assert_eq!(lc.state, MessageState::Queued);
        assert!(!lc.apply(Signal::Queued, t0()).changed);

        lc.apply(Signal::Cancelled, t0());
        assert_eq!(lc.state, MessageState::Cancelled);

        let mut opened = sent();
        opened.apply(EventKind::Opened.into(), t0());
        assert!(!opened.apply(Signal::Cancelled, t0()).state_changed());
    }

    #[test]
    fn test_state_never_regresses_on_main_order() {
        // Every ordering of the engagement events ends at the same high-water mark.
        let events = [
            EventKind::SendSucceeded,
            EventKind::Opened,
            EventKind::LinkClicked,
            EventKind::Replied,
            EventKind::Created,
        ];
        let mut orders = vec![events.to_vec()];
        let mut reversed = events.to_vec();
        reversed.reverse();
        orders.push(reversed);
        orders.push(vec![
            EventKind::Opened,
            EventKind::Replied,
            EventKind::SendSucceeded,
            EventKind::Created,
            EventKind::LinkClicked,
        ]);

        for order in orders {
            let mut lc = MessageLifecycle::with_state(MessageState::Queued);
            let mut last_rank = lc.state.rank().unwrap();
            for kind in order {
                lc.apply(kind.into(), t0());
                let rank = lc.state.rank().unwrap();
                assert!(rank >= last_rank);
                last_rank = rank;
            }
            assert_eq!(lc.state, MessageState::Replied);
            assert_eq!(lc.open_count, 1);
            assert_eq!(lc.click_count, 1);
        }
    }
}
