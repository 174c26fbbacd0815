//! Collaborators used by the order-processing activities.

pub mod notification;
pub mod persistence;

pub use notification::{
    InMemoryNotificationPublisher, NotificationError, NotificationEvent, NotificationPublisher,
};
pub use persistence::{InMemoryOrderRepository, OrderRepository, PersistenceError, SaveOutcome};
