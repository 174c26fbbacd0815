//! Instance lifecycle states.

use serde::{Deserialize, Serialize};

use crate::activities::ActivityName;

/// The observable state of an orchestration instance.
///
/// State transitions:
/// ```text
/// Pending ──► Validating ──► Saving ──► Notifying ──► Completed
///    │            │            │            │
///    └────────────┴────────────┴────────────┴──────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InstanceState {
    /// Created, no activity scheduled yet.
    #[default]
    Pending,

    /// The order is being validated.
    Validating,

    /// The order is being saved.
    Saving,

    /// The processed-order notification is being published.
    Notifying,

    /// The order was processed (terminal state).
    Completed,

    /// The order was rejected, faulted or cancelled (terminal state).
    Failed,
}

impl InstanceState {
    /// Returns the state while `activity` is the current step.
    pub fn running(activity: ActivityName) -> Self {
        match activity {
            ActivityName::ValidateOrder => InstanceState::Validating,
            ActivityName::SaveOrder => InstanceState::Saving,
            ActivityName::NotifyOrderProcessed => InstanceState::Notifying,
        }
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Completed | InstanceState::Failed)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "Pending",
            InstanceState::Validating => "Validating",
            InstanceState::Saving => "Saving",
            InstanceState::Notifying => "Notifying",
            InstanceState::Completed => "Completed",
            InstanceState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_pending() {
        assert_eq!(InstanceState::default(), InstanceState::Pending);
    }

    #[test]
    fn test_is_terminal() {
        assert!(!InstanceState::Pending.is_terminal());
        assert!(!InstanceState::Validating.is_terminal());
        assert!(!InstanceState::Saving.is_terminal());
        assert!(!InstanceState::Notifying.is_terminal());
        assert!(InstanceState::Completed.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
    }

    #[test]
    fn test_running_state_per_activity() {
        assert_eq!(
            InstanceState::running(ActivityName::ValidateOrder),
            InstanceState::Validating
        );
        assert_eq!(
            InstanceState::running(ActivityName::SaveOrder),
            InstanceState::Saving
        );
        assert_eq!(
            InstanceState::running(ActivityName::NotifyOrderProcessed),
            InstanceState::Notifying
        );
    }

    #[test]
    fn test_serialization_roundtrip() {
        let json = serde_json::to_string(&InstanceState::Notifying).unwrap();
        assert_eq!(json, "\"Notifying\"");
        let back: InstanceState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InstanceState::Notifying);
    }
}
