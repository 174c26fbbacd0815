//! The three order-processing activities and their executor.

use std::str::FromStr;

use domain::Order;
use history_store::FailureKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::services::{
    NotificationError, NotificationEvent, NotificationPublisher, OrderRepository,
    PersistenceError,
};

/// The activities of the order-processing workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityName {
    ValidateOrder,
    SaveOrder,
    NotifyOrderProcessed,
}

impl ActivityName {
    /// Every activity in execution order.
    pub const ALL: [ActivityName; 3] = [
        ActivityName::ValidateOrder,
        ActivityName::SaveOrder,
        ActivityName::NotifyOrderProcessed,
    ];

    /// Returns the name recorded in history.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityName::ValidateOrder => "ValidateOrder",
            ActivityName::SaveOrder => "SaveOrder",
            ActivityName::NotifyOrderProcessed => "NotifyOrderProcessed",
        }
    }
}

impl std::fmt::Display for ActivityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a recorded name matches no known activity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown activity '{0}'")]
pub struct UnknownActivity(pub String);

impl FromStr for ActivityName {
    type Err = UnknownActivity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityName::ALL
            .into_iter()
            .find(|activity| activity.as_str() == s)
            .ok_or_else(|| UnknownActivity(s.to_string()))
    }
}

/// A failed activity attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    /// The attempt may succeed if retried.
    #[error("{0}")]
    Transient(String),

    /// The attempt can never succeed.
    #[error("{0}")]
    Permanent(String),
}

impl ActivityError {
    /// Returns how the failure is recorded in history.
    pub fn kind(&self) -> FailureKind {
        match self {
            ActivityError::Transient(_) => FailureKind::Transient,
            ActivityError::Permanent(_) => FailureKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }
}

impl From<PersistenceError> for ActivityError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Unavailable(_) => ActivityError::Transient(err.to_string()),
            PersistenceError::Rejected(_) => ActivityError::Permanent(err.to_string()),
        }
    }
}

impl From<NotificationError> for ActivityError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::Unavailable(_) => ActivityError::Transient(err.to_string()),
            NotificationError::Rejected(_) => ActivityError::Permanent(err.to_string()),
        }
    }
}

/// Runs activities against the order repository and notification publisher.
///
/// Each call handles exactly one attempt; retries, timeouts and recording
/// the outcome are the runtime's job.
pub struct ActivityExecutor<R, N>
where
    R: OrderRepository,
    N: NotificationPublisher,
{
    repository: R,
    publisher: N,
}

impl<R, N> ActivityExecutor<R, N>
where
    R: OrderRepository,
    N: NotificationPublisher,
{
    /// Creates a new executor.
    pub fn new(repository: R, publisher: N) -> Self {
        Self {
            repository,
            publisher,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn publisher(&self) -> &N {
        &self.publisher
    }

    /// Executes one attempt of `activity` with the recorded `input`.
    ///
    /// `ValidateOrder` yields a JSON boolean. The other two yield a small
    /// acknowledgement object.
    #[tracing::instrument(skip(self, input))]
    pub async fn execute(&self, activity: ActivityName, input: &Value) -> Result<Value, ActivityError> {
        let order: Order = serde_json::from_value(input.clone())
            .map_err(|e| ActivityError::Permanent(format!("malformed order input: {e}")))?;

        match activity {
            ActivityName::ValidateOrder => Ok(Value::Bool(Self::validate(&order))),
            ActivityName::SaveOrder => {
                let outcome = self.repository.save(&order).await?;
                tracing::info!(order_id = %order.id, outcome = outcome.as_str(), "order saved");
                Ok(serde_json::json!({
                    "orderId": order.id,
                    "outcome": outcome.as_str(),
                }))
            }
            ActivityName::NotifyOrderProcessed => {
                let event = NotificationEvent::order_processed(&order);
                let subject = event.subject.clone();
                self.publisher.publish(event).await?;
                tracing::info!(order_id = %order.id, %subject, "order processed notification published");
                Ok(serde_json::json!({
                    "eventType": NotificationEvent::ORDER_PROCESSED,
                    "subject": subject,
                }))
            }
        }
    }

    fn validate(order: &Order) -> bool {
        let errors = order.validate();
        if errors.is_empty() {
            return true;
        }
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        tracing::warn!(order_id = %order.id, errors = ?messages, "order failed validation");
        false
    }
}
