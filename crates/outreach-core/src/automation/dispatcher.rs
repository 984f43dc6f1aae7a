//! Automation Dispatcher - Side effects triggered by message events

use super::classifier::{reply_text, ReplyClassifier, ReplyIntent};
use crate::gateway::GatewayError;
use crate::metrics::CoreMetrics;
use outreach_common::types::{BounceSeverity, EventKind, MessageState, TaskKind};
use outreach_common::{Clock, Result, Signal};
use outreach_storage::models::{InboundEvent, NewReviewTask, OutreachMessage, SendQueueItem};
use outreach_storage::repository::{
    MessageRepository, QueueRepository, ReviewTaskRepository, SuppressionRepository,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Something the dispatcher did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationAction {
    Suppressed { email: String },
    CancelledPending { count: usize },
    Concluded { state: MessageState },
    TaskCreated { kind: TaskKind },
}

impl AutomationAction {
    fn label(&self) -> &'static str {
        match self {
            AutomationAction::Suppressed { .. } => "suppressed",
            AutomationAction::CancelledPending { .. } => "cancelled_pending",
            AutomationAction::Concluded {
                state: MessageState::Booked,
            } => "booked",
            AutomationAction::Concluded { .. } => "rejected",
            AutomationAction::TaskCreated { .. } => "task_created",
        }
    }
}

/// Automation Dispatcher
pub struct AutomationDispatcher {
    messages: Arc<dyn MessageRepository>,
    queue: Arc<dyn QueueRepository>,
    suppressions: Arc<dyn SuppressionRepository>,
    tasks: Arc<dyn ReviewTaskRepository>,
    classifier: Arc<dyn ReplyClassifier>,
    clock: Arc<dyn Clock>,
    metrics: Arc<CoreMetrics>,
}

impl AutomationDispatcher {
    /// Create a new dispatcher
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        queue: Arc<dyn QueueRepository>,
        suppressions: Arc<dyn SuppressionRepository>,
        tasks: Arc<dyn ReviewTaskRepository>,
        classifier: Arc<dyn ReplyClassifier>,
        clock: Arc<dyn Clock>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            messages,
            queue,
            suppressions,
            tasks,
            classifier,
            clock,
            metrics,
        }
    }

    /// React to an event that was applied to `message`.
    ///
    /// Every rule is safe to run twice for the same event. Failures are
    /// logged and counted, never returned.
    pub async fn dispatch(
        &self,
        event: &InboundEvent,
        message: &OutreachMessage,
    ) -> Vec<AutomationAction> {
        let result = match (event.kind(), message.state_enum()) {
            (Ok(kind), Ok(state)) => self.run_rules(kind, state, event, message).await,
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        self.settle(result, message)
    }

    /// Follow-up for a send that will not be retried
    pub async fn handle_failed_send(
        &self,
        item: &SendQueueItem,
        message: &OutreachMessage,
        failure: &GatewayError,
    ) -> Vec<AutomationAction> {
        let result = self.failed_send_rules(item, message, failure).await;
        self.settle(result, message)
    }

    fn settle(
        &self,
        result: Result<Vec<AutomationAction>>,
        message: &OutreachMessage,
    ) -> Vec<AutomationAction> {
        match result {
            Ok(actions) => {
                for action in &actions {
                    self.metrics.dispatcher_action(action.label());
                }
                actions
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Automation dispatch failed");
                self.metrics.dispatcher_error();
                Vec::new()
            }
        }
    }

    async fn run_rules(
        &self,
        kind: EventKind,
        state: MessageState,
        event: &InboundEvent,
        message: &OutreachMessage,
    ) -> Result<Vec<AutomationAction>> {
        match kind {
            EventKind::Bounced if state == MessageState::Bounced => {
                if event.bounce_severity_enum() == Some(BounceSeverity::Hard) {
                    self.suppress_recipient(message, "hard_bounce").await
                } else {
                    debug!(message_id = %message.id, "Soft bounce, recipient stays contactable");
                    Ok(Vec::new())
                }
            }
            EventKind::Replied if state == MessageState::Replied => {
                self.handle_reply(event, message).await
            }
            // State ordering keeps clicks from regressing a reply; nothing to fire
            EventKind::LinkClicked => Ok(Vec::new()),
            _ => Ok(Vec::new()),
        }
    }

    async fn handle_reply(
        &self,
        event: &InboundEvent,
        message: &OutreachMessage,
    ) -> Result<Vec<AutomationAction>> {
        let intent = self.classifier.classify(&reply_text(&event.payload));
        info!(message_id = %message.id, intent = %intent, "Reply received");

        let now = self.clock.now();
        let mut actions = Vec::new();
        match intent {
            ReplyIntent::Booking => {
                let booked = self
                    .messages
                    .apply_signal(message.id, Signal::Booked, now)
                    .await?;
                if let Some((_, transition)) = booked.filter(|(_, t)| t.state_changed()) {
                    actions.push(AutomationAction::Concluded { state: transition.to });
                    let created = self
                        .tasks
                        .create(
                            NewReviewTask {
                                kind: TaskKind::BookingFollowUp,
                                related_id: message.id,
                                priority: 2,
                                notes: format!("Booking reply from {}", message.recipient_email),
                                idempotency_key: format!(
                                    "{}:{}",
                                    TaskKind::BookingFollowUp,
                                    message.id
                                ),
                            },
                            now,
                        )
                        .await?;
                    if created.is_some() {
                        actions.push(AutomationAction::TaskCreated {
                            kind: TaskKind::BookingFollowUp,
                        });
                    }
                }
            }
            ReplyIntent::Rejection => {
                let rejected = self
                    .messages
                    .apply_signal(message.id, Signal::Rejected, now)
                    .await?;
                if let Some((_, transition)) = rejected.filter(|(_, t)| t.state_changed()) {
                    actions.push(AutomationAction::Concluded { state: transition.to });
                }
            }
            ReplyIntent::Question => {}
            ReplyIntent::Unclassified => {
                let created = self
                    .tasks
                    .create(
                        NewReviewTask {
                            kind: TaskKind::UnclassifiedReply,
                            related_id: message.id,
                            priority: 1,
                            notes: format!(
                                "Reply from {} needs review",
                                message.recipient_email
                            ),
                            idempotency_key: format!(
                                "{}:{}",
                                TaskKind::UnclassifiedReply,
                                event.provider_event_id
                            ),
                        },
                        now,
                    )
                    .await?;
                if created.is_some() {
                    actions.push(AutomationAction::TaskCreated {
                        kind: TaskKind::UnclassifiedReply,
                    });
                }
            }
        }
        Ok(actions)
    }

    async fn failed_send_rules(
        &self,
        item: &SendQueueItem,
        message: &OutreachMessage,
        failure: &GatewayError,
    ) -> Result<Vec<AutomationAction>> {
        let mut actions = Vec::new();
        if failure.invalid_recipient() {
            actions.extend(self.suppress_recipient(message, "invalid_recipient").await?);
        }

        let created = self
            .tasks
            .create(
                NewReviewTask {
                    kind: TaskKind::SendFailed,
                    related_id: item.id,
                    priority: 0,
                    notes: format!(
                        "Send of message {} to {} failed after {} attempt(s): {}",
                        message.id, message.recipient_email, item.attempts, failure
                    ),
                    idempotency_key: format!("{}:{}", TaskKind::SendFailed, item.id),
                },
                self.clock.now(),
            )
            .await?;
        if created.is_some() {
            actions.push(AutomationAction::TaskCreated {
                kind: TaskKind::SendFailed,
            });
        }
        Ok(actions)
    }

    async fn suppress_recipient(
        &self,
        message: &OutreachMessage,
        reason: &str,
    ) -> Result<Vec<AutomationAction>> {
        let now = self.clock.now();
        let mut actions = Vec::new();

        if self
            .suppressions
            .suppress(&message.recipient_email, reason, Some(message.id), now)
            .await?
        {
            warn!(
                message_id = %message.id,
                reason = %reason,
                "Recipient suppressed"
            );
            actions.push(AutomationAction::Suppressed {
                email: message.recipient_email.clone(),
            });
        }

        let cancelled = self
            .queue
            .cancel_pending_for_recipient(&message.recipient_email, Some(message.id), now)
            .await?;
        if !cancelled.is_empty() {
            actions.push(AutomationAction::CancelledPending {
                count: cancelled.len(),
            });
        }
        Ok(actions)
    }
}
