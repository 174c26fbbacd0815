//! Replay-based decision logic for the order-processing workflow.
//!
//! The engine never performs side effects. Given an instance's input and
//! history it decides the single next action; the runtime carries the action
//! out and records its outcome, after which the engine is consulted again.
//! Because the decision only depends on the recorded history, replaying any
//! prefix of a history yields the same decisions that were made live.

use std::time::Duration;

use chrono::{DateTime, Utc};
use domain::Order;
use history_store::{
    FailureKind, HistoryEvent, HistoryRecord, InstanceId, Sequence, StoredInstance,
};
use serde_json::Value;

use crate::activities::ActivityName;
use crate::error::OrchestrationError;
use crate::order_processing;
use crate::retry::RetryPolicy;
use crate::state::InstanceState;

/// An instance rebuilt from the store: its input plus recorded history.
#[derive(Debug, Clone)]
pub struct OrchestrationInstance {
    pub instance_id: InstanceId,
    pub order: Order,
    /// The input exactly as stored; activities are scheduled with it.
    pub input: Value,
    pub records: Vec<HistoryRecord>,
}

impl OrchestrationInstance {
    /// Rebuilds an instance, reading the stored input back as an order.
    pub fn from_stored(stored: StoredInstance) -> Result<Self, OrchestrationError> {
        let order = serde_json::from_value(stored.input.clone()).map_err(|e| {
            OrchestrationError::InvalidInput {
                instance_id: stored.instance_id,
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            instance_id: stored.instance_id,
            order,
            input: stored.input,
            records: stored.records,
        })
    }

    /// Builds an instance from an order and a list of events, numbering the
    /// events from the first sequence.
    pub fn with_history(
        instance_id: InstanceId,
        order: Order,
        events: Vec<HistoryEvent>,
    ) -> Result<Self, OrchestrationError> {
        let input = serde_json::to_value(&order)?;
        let recorded_at = order.created_at;
        let mut sequence = Sequence::initial();
        let records = events
            .into_iter()
            .map(|event| {
                sequence = sequence.next();
                HistoryRecord {
                    instance_id,
                    sequence,
                    recorded_at,
                    event,
                }
            })
            .collect();

        Ok(Self {
            instance_id,
            order,
            input,
            records,
        })
    }

    /// Returns the recorded events in order.
    pub fn events(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.records.iter().map(|r| &r.event)
    }

    /// Returns the sequence of the last record.
    pub fn last_sequence(&self) -> Sequence {
        self.records
            .last()
            .map(|r| r.sequence)
            .unwrap_or(Sequence::initial())
    }

    /// Returns the deadline recorded when `activity` was scheduled.
    pub fn scheduled_deadline(&self, activity: ActivityName) -> Option<DateTime<Utc>> {
        self.events().find_map(|event| match event {
            HistoryEvent::ActivityScheduled(data) if data.name == activity.as_str() => {
                Some(data.deadline)
            }
            _ => None,
        })
    }
}

/// The next step for an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Record that `activity` is scheduled, then run its first attempt.
    ScheduleActivity { activity: ActivityName, input: Value },

    /// Wait `delay`, then run attempt `attempt` of an already scheduled activity.
    RetryActivity {
        activity: ActivityName,
        input: Value,
        attempt: u32,
        delay: Duration,
    },

    /// An attempt was started but its outcome was never recorded.
    AwaitActivity { activity: ActivityName, attempt: u32 },

    /// Record successful completion.
    Complete { output: String },

    /// Record failure.
    Fail { reason: String },

    /// The instance is terminal; nothing to do.
    Idle,
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Complete { .. } | Action::Fail { .. })
    }
}

/// How an instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed(String),
    Failed(String),
}

/// Where the replayed history currently stands.
#[derive(Debug, Clone, PartialEq)]
enum Cursor {
    NotStarted,
    /// Scheduled, with attempt `attempt` outstanding and no outcome recorded.
    Outstanding {
        activity: ActivityName,
        input: Value,
        attempt: u32,
    },
    /// The latest attempt failed transiently.
    Retrying {
        activity: ActivityName,
        input: Value,
        failed_attempt: u32,
        error: String,
    },
    Succeeded {
        activity: ActivityName,
        result: Value,
    },
    Faulted {
        activity: ActivityName,
        error: String,
    },
    /// The history cannot have been produced by this workflow.
    Corrupt(String),
    Finished(Terminal),
}

/// The result of folding a history.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    cursor: Cursor,
    scheduled: Vec<ActivityName>,
}

impl Default for Replay {
    fn default() -> Self {
        Self {
            cursor: Cursor::NotStarted,
            scheduled: Vec::new(),
        }
    }
}

/// Folds `events` in order.
pub fn replay<'a>(events: impl IntoIterator<Item = &'a HistoryEvent>) -> Replay {
    let mut replay = Replay::default();
    for event in events {
        replay.apply(event);
    }
    replay
}

impl Replay {
    /// Applies one event. Events after a terminal event are ignored.
    pub fn apply(&mut self, event: &HistoryEvent) {
        match event {
            HistoryEvent::OrchestrationCompleted(data) => {
                if !self.is_terminal() {
                    self.cursor = Cursor::Finished(Terminal::Completed(data.output.clone()));
                }
                return;
            }
            HistoryEvent::OrchestrationFailed(data) => {
                if !self.is_terminal() {
                    self.cursor = Cursor::Finished(Terminal::Failed(data.reason.clone()));
                }
                return;
            }
            _ => {}
        }

        if matches!(self.cursor, Cursor::Finished(_) | Cursor::Corrupt(_)) {
            return;
        }

        match event {
            HistoryEvent::ActivityScheduled(data) => {
                let activity = match data.name.parse::<ActivityName>() {
                    Ok(activity) => activity,
                    Err(e) => return self.corrupt(e.to_string()),
                };
                if self.scheduled.contains(&activity) {
                    return self.corrupt(format!("{activity} was scheduled more than once"));
                }
                if self.next_activity() != Some(activity) {
                    return self.corrupt(format!("{activity} was scheduled out of order"));
                }
                self.scheduled.push(activity);
                self.cursor = Cursor::Outstanding {
                    activity,
                    input: data.input.clone(),
                    attempt: 1,
                };
            }
            HistoryEvent::ActivityCompleted(data) => match self.outstanding(&data.name) {
                Some((activity, _)) => {
                    self.cursor = Cursor::Succeeded {
                        activity,
                        result: data.result.clone(),
                    };
                }
                None => self.corrupt(format!(
                    "completion recorded for {} which is not outstanding",
                    data.name
                )),
            },
            HistoryEvent::ActivityFailed(data) => match self.outstanding(&data.name) {
                Some((activity, input)) => {
                    self.cursor = match data.kind {
                        FailureKind::Transient => Cursor::Retrying {
                            activity,
                            input,
                            failed_attempt: data.attempt,
                            error: data.error.clone(),
                        },
                        FailureKind::Permanent => Cursor::Faulted {
                            activity,
                            error: data.error.clone(),
                        },
                    };
                }
                None => self.corrupt(format!(
                    "failure recorded for {} which is not outstanding",
                    data.name
                )),
            },
            HistoryEvent::OrchestrationCompleted(_) | HistoryEvent::OrchestrationFailed(_) => {}
        }
    }

    /// Returns the observable state.
    pub fn state(&self) -> InstanceState {
        match &self.cursor {
            Cursor::Finished(Terminal::Completed(_)) => InstanceState::Completed,
            Cursor::Finished(Terminal::Failed(_)) => InstanceState::Failed,
            _ => self
                .scheduled
                .last()
                .map(|activity| InstanceState::running(*activity))
                .unwrap_or(InstanceState::Pending),
        }
    }

    /// Returns the output or failure reason once terminal.
    pub fn output(&self) -> Option<&str> {
        match &self.cursor {
            Cursor::Finished(Terminal::Completed(output)) => Some(output),
            Cursor::Finished(Terminal::Failed(reason)) => Some(reason),
            _ => None,
        }
    }

    pub fn terminal(&self) -> Option<&Terminal> {
        match &self.cursor {
            Cursor::Finished(terminal) => Some(terminal),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.cursor, Cursor::Finished(_))
    }

    /// Activities scheduled so far, in order.
    pub fn scheduled(&self) -> &[ActivityName] {
        &self.scheduled
    }

    /// The activity whose outcome is awaited, if any.
    pub fn outstanding_activity(&self) -> Option<ActivityName> {
        match &self.cursor {
            Cursor::Outstanding { activity, .. } | Cursor::Retrying { activity, .. } => {
                Some(*activity)
            }
            _ => None,
        }
    }

    /// The activity the workflow would schedule next.
    fn next_activity(&self) -> Option<ActivityName> {
        match &self.cursor {
            Cursor::NotStarted => Some(ActivityName::ValidateOrder),
            Cursor::Succeeded {
                activity: ActivityName::ValidateOrder,
                result,
            } if result.as_bool() == Some(true) => Some(ActivityName::SaveOrder),
            Cursor::Succeeded {
                activity: ActivityName::SaveOrder,
                ..
            } => Some(ActivityName::NotifyOrderProcessed),
            _ => None,
        }
    }

    fn outstanding(&self, name: &str) -> Option<(ActivityName, Value)> {
        match &self.cursor {
            Cursor::Outstanding {
                activity, input, ..
            }
            | Cursor::Retrying {
                activity, input, ..
            } if activity.as_str() == name => Some((*activity, input.clone())),
            _ => None,
        }
    }

    fn corrupt(&mut self, detail: String) {
        self.cursor = Cursor::Corrupt(detail);
    }
}

/// Decides the next action of an order-processing instance.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    retry_policy: RetryPolicy,
}

impl Engine {
    /// Creates an engine that retries transient failures per `retry_policy`.
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Replays the instance's history and returns the next action.
    pub fn advance(&self, instance: &OrchestrationInstance) -> Action {
        self.decide(&replay(instance.events()), instance)
    }

    /// Returns the next action for an already folded history.
    pub fn decide(&self, replay: &Replay, instance: &OrchestrationInstance) -> Action {
        match &replay.cursor {
            Cursor::Finished(_) => Action::Idle,
            Cursor::NotStarted => Action::ScheduleActivity {
                activity: ActivityName::ValidateOrder,
                input: instance.input.clone(),
            },
            Cursor::Outstanding {
                activity, attempt, ..
            } => Action::AwaitActivity {
                activity: *activity,
                attempt: *attempt,
            },
            Cursor::Retrying {
                activity,
                input,
                failed_attempt,
                error,
            } => {
                if self.retry_policy.should_retry(*failed_attempt) {
                    Action::RetryActivity {
                        activity: *activity,
                        input: input.clone(),
                        attempt: failed_attempt + 1,
                        delay: self.retry_policy.backoff_after(*failed_attempt),
                    }
                } else {
                    Action::Fail {
                        reason: order_processing::error_reason(format!(
                            "{activity} failed after {failed_attempt} attempts: {error}"
                        )),
                    }
                }
            }
            Cursor::Faulted { activity, error } => Action::Fail {
                reason: order_processing::error_reason(format!("{activity} failed: {error}")),
            },
            Cursor::Corrupt(detail) => Action::Fail {
                reason: order_processing::error_reason(format!("inconsistent history: {detail}")),
            },
            Cursor::Succeeded { activity, result } => match activity {
                ActivityName::ValidateOrder => match result.as_bool() {
                    Some(true) => Action::ScheduleActivity {
                        activity: ActivityName::SaveOrder,
                        input: instance.input.clone(),
                    },
                    Some(false) => Action::Fail {
                        reason: order_processing::VALIDATION_FAILED.to_string(),
                    },
                    None => Action::Fail {
                        reason: order_processing::error_reason(format!(
                            "ValidateOrder returned a non-boolean result: {result}"
                        )),
                    },
                },
                ActivityName::SaveOrder => Action::ScheduleActivity {
                    activity: ActivityName::NotifyOrderProcessed,
                    input: instance.input.clone(),
                },
                ActivityName::NotifyOrderProcessed => Action::Complete {
                    output: order_processing::completed_output(instance.order.id),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Money, NewOrder, OrderItem};

    fn order(customer: &str) -> Order {
        NewOrder {
            customer_name: Some(customer.to_string()),
            items: Some(vec![OrderItem::new("P1", "Widget", 2, Money::from_cents(999))]),
            total_amount: Money::from_cents(1998),
            ..Default::default()
        }
        .into_order(Utc::now())
    }

    fn instance(events: Vec<HistoryEvent>) -> OrchestrationInstance {
        OrchestrationInstance::with_history(InstanceId::new(), order("Alice"), events).unwrap()
    }

    fn scheduled(activity: ActivityName) -> HistoryEvent {
        HistoryEvent::activity_scheduled(activity.as_str(), serde_json::json!({}), Utc::now())
    }

    fn completed(activity: ActivityName, result: Value) -> HistoryEvent {
        HistoryEvent::activity_completed(activity.as_str(), result, 1)
    }

    fn failed(activity: ActivityName, kind: FailureKind, attempt: u32) -> HistoryEvent {
        HistoryEvent::activity_failed(activity.as_str(), "boom", kind, attempt)
    }

    fn engine() -> Engine {
        Engine::new(RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
        ))
    }

    #[test]
    fn test_empty_history_schedules_validation_with_input() {
        let instance = instance(vec![]);
        assert_eq!(
            engine().advance(&instance),
            Action::ScheduleActivity {
                activity: ActivityName::ValidateOrder,
                input: instance.input.clone(),
            }
        );
    }

    #[test]
    fn test_happy_path_decisions() {
        use ActivityName::*;

        let mut events = vec![scheduled(ValidateOrder), completed(ValidateOrder, Value::Bool(true))];
        assert!(matches!(
            engine().advance(&instance(events.clone())),
            Action::ScheduleActivity { activity: SaveOrder, .. }
        ));

        events.extend([scheduled(SaveOrder), completed(SaveOrder, Value::Null)]);
        assert!(matches!(
            engine().advance(&instance(events.clone())),
            Action::ScheduleActivity { activity: NotifyOrderProcessed, .. }
        ));

        events.extend([
            scheduled(NotifyOrderProcessed),
            completed(NotifyOrderProcessed, Value::Null),
        ]);
        let instance = instance(events);
        assert_eq!(
            engine().advance(&instance),
            Action::Complete {
                output: format!("Order {} processed successfully", instance.order.id)
            }
        );
    }

    #[test]
    fn test_invalid_order_fails_without_saving() {
        let instance = instance(vec![
            scheduled(ActivityName::ValidateOrder),
            completed(ActivityName::ValidateOrder, Value::Bool(false)),
        ]);
        assert_eq!(
            engine().advance(&instance),
            Action::Fail {
                reason: "Order validation failed".to_string()
            }
        );
    }

    #[test]
    fn test_non_boolean_validation_result_is_a_fault() {
        let instance = instance(vec![
            scheduled(ActivityName::ValidateOrder),
            completed(ActivityName::ValidateOrder, serde_json::json!("yes")),
        ]);
        assert!(matches!(
            engine().advance(&instance),
            Action::Fail { reason } if reason.starts_with("Error processing order: ")
        ));
    }

    #[test]
    fn test_transient_failure_is_retried_with_backoff() {
        let instance = instance(vec![
            scheduled(ActivityName::ValidateOrder),
            completed(ActivityName::ValidateOrder, Value::Bool(true)),
            scheduled(ActivityName::SaveOrder),
            failed(ActivityName::SaveOrder, FailureKind::Transient, 1),
            failed(ActivityName::SaveOrder, FailureKind::Transient, 2),
        ]);
        assert_eq!(
            engine().advance(&instance),
            Action::RetryActivity {
                activity: ActivityName::SaveOrder,
                input: serde_json::json!({}),
                attempt: 3,
                delay: Duration::from_millis(200),
            }
        );
    }

    #[test]
    fn test_retries_exhausted() {
        let instance = instance(vec![
            scheduled(ActivityName::ValidateOrder),
            completed(ActivityName::ValidateOrder, Value::Bool(true)),
            scheduled(ActivityName::SaveOrder),
            failed(ActivityName::SaveOrder, FailureKind::Transient, 1),
            failed(ActivityName::SaveOrder, FailureKind::Transient, 2),
            failed(ActivityName::SaveOrder, FailureKind::Transient, 3),
        ]);
        assert_eq!(
            engine().advance(&instance),
            Action::Fail {
                reason: "Error processing order: SaveOrder failed after 3 attempts: boom"
                    .to_string()
            }
        );
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let instance = instance(vec![
            scheduled(ActivityName::ValidateOrder),
            completed(ActivityName::ValidateOrder, Value::Bool(true)),
            scheduled(ActivityName::SaveOrder),
            completed(ActivityName::SaveOrder, Value::Null),
            scheduled(ActivityName::NotifyOrderProcessed),
            failed(ActivityName::NotifyOrderProcessed, FailureKind::Permanent, 1),
        ]);
        assert_eq!(
            engine().advance(&instance),
            Action::Fail {
                reason: "Error processing order: NotifyOrderProcessed failed: boom".to_string()
            }
        );
    }

    #[test]
    fn test_outstanding_attempt_is_awaited() {
        let instance = instance(vec![scheduled(ActivityName::ValidateOrder)]);
        assert_eq!(
            engine().advance(&instance),
            Action::AwaitActivity {
                activity: ActivityName::ValidateOrder,
                attempt: 1
            }
        );
        assert!(instance.scheduled_deadline(ActivityName::ValidateOrder).is_some());
        assert!(instance.scheduled_deadline(ActivityName::SaveOrder).is_none());
    }

    #[test]
    fn test_terminal_history_is_idle() {
        let completed = instance(vec![HistoryEvent::orchestration_completed("done")]);
        let failed = instance(vec![HistoryEvent::orchestration_failed("cancelled")]);
        assert_eq!(engine().advance(&completed), Action::Idle);
        assert_eq!(engine().advance(&failed), Action::Idle);
    }

    #[test]
    fn test_completion_for_unscheduled_activity_is_corruption() {
        let instance = instance(vec![completed(ActivityName::SaveOrder, Value::Null)]);
        assert!(matches!(
            engine().advance(&instance),
            Action::Fail { reason } if reason.contains("not outstanding")
        ));
    }

    #[test]
    fn test_duplicate_and_out_of_order_schedules_are_corruption() {
        let twice = instance(vec![
            scheduled(ActivityName::ValidateOrder),
            completed(ActivityName::ValidateOrder, Value::Bool(true)),
            scheduled(ActivityName::ValidateOrder),
        ]);
        assert!(matches!(
            engine().advance(&twice),
            Action::Fail { reason } if reason.contains("more than once")
        ));

        let skipped = instance(vec![scheduled(ActivityName::SaveOrder)]);
        assert!(matches!(
            engine().advance(&skipped),
            Action::Fail { reason } if reason.contains("out of order")
        ));
    }

    #[test]
    fn test_replay_state_and_output() {
        let events = vec![
            scheduled(ActivityName::ValidateOrder),
            completed(ActivityName::ValidateOrder, Value::Bool(true)),
            scheduled(ActivityName::SaveOrder),
        ];
        let progress = replay(&events);
        assert_eq!(progress.state(), InstanceState::Saving);
        assert_eq!(progress.output(), None);
        assert_eq!(progress.outstanding_activity(), Some(ActivityName::SaveOrder));
        assert_eq!(
            progress.scheduled(),
            &[ActivityName::ValidateOrder, ActivityName::SaveOrder]
        );

        let mut events = events;
        events.push(HistoryEvent::orchestration_failed("cancelled"));
        events.push(HistoryEvent::orchestration_completed("ignored"));
        let progress = replay(&events);
        assert_eq!(progress.state(), InstanceState::Failed);
        assert_eq!(progress.output(), Some("cancelled"));
        assert_eq!(
            progress.terminal(),
            Some(&Terminal::Failed("cancelled".to_string()))
        );
    }

    #[test]
    fn test_replay_of_empty_history_is_pending() {
        let progress = replay(std::iter::empty::<&HistoryEvent>());
        assert_eq!(progress.state(), InstanceState::Pending);
        assert!(!progress.is_terminal());
    }

    #[test]
    fn test_decisions_are_deterministic() {
        let instance = instance(vec![
            scheduled(ActivityName::ValidateOrder),
            failed(ActivityName::ValidateOrder, FailureKind::Transient, 1),
        ]);
        let engine = engine();
        assert_eq!(engine.advance(&instance), engine.advance(&instance));
    }
}
