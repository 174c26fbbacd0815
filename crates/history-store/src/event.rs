use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::InstanceId;

/// Position of a record in an instance's history.
///
/// Sequences start at 1 for the first record and increment by 1 for each
/// subsequent record appended to the same instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    /// Creates a sequence from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial sequence (0) of an empty history.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the sequence (1) of the first record.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw sequence value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Sequence {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Whether a failed activity attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The collaborator was unavailable or the attempt timed out.
    Transient,
    /// The input was malformed or the step can never succeed.
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fact recorded in an orchestration's history.
///
/// History is append-only: events are never mutated or reordered, and a
/// terminal event (`OrchestrationCompleted` or `OrchestrationFailed`) is
/// always the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum HistoryEvent {
    /// An activity was scheduled for execution.
    ActivityScheduled(ActivityScheduledData),

    /// An activity attempt finished successfully.
    ActivityCompleted(ActivityCompletedData),

    /// An activity attempt failed.
    ActivityFailed(ActivityFailedData),

    /// The orchestration finished successfully (terminal).
    OrchestrationCompleted(OrchestrationCompletedData),

    /// The orchestration failed or was cancelled (terminal).
    OrchestrationFailed(OrchestrationFailedData),
}

impl HistoryEvent {
    /// Creates an `ActivityScheduled` event.
    pub fn activity_scheduled(
        name: impl Into<String>,
        input: serde_json::Value,
        deadline: DateTime<Utc>,
    ) -> Self {
        HistoryEvent::ActivityScheduled(ActivityScheduledData {
            name: name.into(),
            input,
            deadline,
        })
    }

    /// Creates an `ActivityCompleted` event.
    pub fn activity_completed(
        name: impl Into<String>,
        result: serde_json::Value,
        attempt: u32,
    ) -> Self {
        HistoryEvent::ActivityCompleted(ActivityCompletedData {
            name: name.into(),
            result,
            attempt,
        })
    }

    /// Creates an `ActivityFailed` event.
    pub fn activity_failed(
        name: impl Into<String>,
        error: impl Into<String>,
        kind: FailureKind,
        attempt: u32,
    ) -> Self {
        HistoryEvent::ActivityFailed(ActivityFailedData {
            name: name.into(),
            error: error.into(),
            kind,
            attempt,
        })
    }

    /// Creates an `OrchestrationCompleted` event.
    pub fn orchestration_completed(output: impl Into<String>) -> Self {
        HistoryEvent::OrchestrationCompleted(OrchestrationCompletedData {
            output: output.into(),
        })
    }

    /// Creates an `OrchestrationFailed` event.
    pub fn orchestration_failed(reason: impl Into<String>) -> Self {
        HistoryEvent::OrchestrationFailed(OrchestrationFailedData {
            reason: reason.into(),
        })
    }

    /// Returns the event type name, used as the stored discriminator.
    pub fn event_type(&self) -> &'static str {
        match self {
            HistoryEvent::ActivityScheduled(_) => "ActivityScheduled",
            HistoryEvent::ActivityCompleted(_) => "ActivityCompleted",
            HistoryEvent::ActivityFailed(_) => "ActivityFailed",
            HistoryEvent::OrchestrationCompleted(_) => "OrchestrationCompleted",
            HistoryEvent::OrchestrationFailed(_) => "OrchestrationFailed",
        }
    }

    /// Returns true if no event may follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HistoryEvent::OrchestrationCompleted(_) | HistoryEvent::OrchestrationFailed(_)
        )
    }

    /// Returns the activity this event refers to, if any.
    pub fn activity_name(&self) -> Option<&str> {
        match self {
            HistoryEvent::ActivityScheduled(data) => Some(&data.name),
            HistoryEvent::ActivityCompleted(data) => Some(&data.name),
            HistoryEvent::ActivityFailed(data) => Some(&data.name),
            HistoryEvent::OrchestrationCompleted(_) | HistoryEvent::OrchestrationFailed(_) => None,
        }
    }
}

/// Data for `ActivityScheduled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityScheduledData {
    /// The activity name.
    pub name: String,
    /// The activity input.
    pub input: serde_json::Value,
    /// When the first attempt expires if no outcome has been recorded.
    pub deadline: DateTime<Utc>,
}

/// Data for `ActivityCompleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityCompletedData {
    pub name: String,
    pub result: serde_json::Value,
    /// The attempt (1-based) that succeeded.
    pub attempt: u32,
}

/// Data for `ActivityFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityFailedData {
    pub name: String,
    pub error: String,
    pub kind: FailureKind,
    /// The attempt (1-based) that failed.
    pub attempt: u32,
}

/// Data for `OrchestrationCompleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationCompletedData {
    pub output: String,
}

/// Data for `OrchestrationFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationFailedData {
    pub reason: String,
}

/// A history event together with its storage metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// The instance this record belongs to.
    pub instance_id: InstanceId,

    /// Position of the record in the instance's history.
    pub sequence: Sequence,

    /// When the record was appended.
    pub recorded_at: DateTime<Utc>,

    /// The recorded event.
    pub event: HistoryEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ordering() {
        let s1 = Sequence::new(1);
        let s2 = Sequence::new(2);
        assert!(s1 < s2);
        assert_eq!(s1.next(), s2);
    }

    #[test]
    fn sequence_initial_and_first() {
        assert_eq!(Sequence::initial().as_i64(), 0);
        assert_eq!(Sequence::first().as_i64(), 1);
        assert_eq!(Sequence::initial().next(), Sequence::first());
    }

    #[test]
    fn terminal_events() {
        assert!(HistoryEvent::orchestration_completed("done").is_terminal());
        assert!(HistoryEvent::orchestration_failed("cancelled").is_terminal());
        assert!(
            !HistoryEvent::activity_completed("SaveOrder", serde_json::json!(null), 1)
                .is_terminal()
        );
    }

    #[test]
    fn activity_name_is_exposed_for_activity_events() {
        let event = HistoryEvent::activity_failed(
            "NotifyOrderProcessed",
            "broker down",
            FailureKind::Transient,
            2,
        );
        assert_eq!(event.activity_name(), Some("NotifyOrderProcessed"));
        assert_eq!(HistoryEvent::orchestration_failed("x").activity_name(), None);
    }

    #[test]
    fn events_use_tagged_representation() {
        let event = HistoryEvent::activity_failed("SaveOrder", "timeout", FailureKind::Transient, 1);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "ActivityFailed");
        assert_eq!(json["data"]["name"], "SaveOrder");
        assert_eq!(json["data"]["kind"], "transient");
        assert_eq!(json["data"]["attempt"], 1);
        assert_eq!(event.event_type(), "ActivityFailed");
    }
}
