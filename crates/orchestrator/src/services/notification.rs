//! Notification publisher trait and in-memory implementation.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use domain::Order;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a notification publisher.
#[derive(Debug, Clone, Error)]
pub enum NotificationError {
    /// The event bus could not be reached; publishing may be retried.
    #[error("event bus unavailable: {0}")]
    Unavailable(String),

    /// The event bus refused the event; retrying cannot help.
    #[error("event rejected by bus: {0}")]
    Rejected(String),
}

/// An event published to downstream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub event_type: String,
    pub subject: String,
    pub data_version: String,
    pub data: serde_json::Value,
}

impl NotificationEvent {
    pub const ORDER_PROCESSED: &'static str = "OrderProcessed";

    /// Builds the event announcing that `order` was processed.
    pub fn order_processed(order: &Order) -> Self {
        Self {
            event_type: Self::ORDER_PROCESSED.to_string(),
            subject: format!("Order/{}", order.id),
            data_version: "1.0".to_string(),
            data: serde_json::json!({
                "orderId": order.id,
                "customerName": order.customer_name,
                "totalAmount": order.total_amount,
            }),
        }
    }
}

/// Publishes notifications to an event bus.
///
/// Delivery is at-least-once: a retried activity may publish the same event
/// again, and subscribers are expected to deduplicate on the subject.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Publishes a single event.
    async fn publish(&self, event: NotificationEvent) -> Result<(), NotificationError>;
}

#[derive(Debug, Default)]
struct InMemoryPublisherState {
    published: Vec<NotificationEvent>,
    transient_failures: u32,
    reject: bool,
    delay: Duration,
}

/// In-memory publisher that records events, with failure injection for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationPublisher {
    state: Arc<RwLock<InMemoryPublisherState>>,
}

impl InMemoryNotificationPublisher {
    /// Creates a new publisher with no recorded events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail as unavailable.
    pub fn fail_next_publishes(&self, count: u32) {
        self.write().transient_failures = count;
    }

    /// Makes every publish fail as rejected while set.
    pub fn set_reject(&self, reject: bool) {
        self.write().reject = reject;
    }

    /// Delays every publish by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.write().delay = delay;
    }

    /// Returns the events published so far.
    pub fn published(&self) -> Vec<NotificationEvent> {
        self.read().published.clone()
    }

    /// Returns the number of events published so far.
    pub fn published_count(&self) -> usize {
        self.read().published.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryPublisherState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryPublisherState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl NotificationPublisher for InMemoryNotificationPublisher {
    async fn publish(&self, event: NotificationEvent) -> Result<(), NotificationError> {
        let delay = self.read().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        if state.reject {
            return Err(NotificationError::Rejected(format!(
                "no route for {}",
                event.event_type
            )));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(NotificationError::Unavailable("broker timeout".to_string()));
        }

        state.published.push(event);
        Ok(())
    }
}
