//! Durable saga orchestration for order processing.
//!
//! An order flows through three activities:
//! 1. Validate the order
//! 2. Save the order
//! 3. Notify that the order was processed
//!
//! Progress is event-sourced: every scheduling decision and activity outcome
//! is appended to the instance's history, and the engine re-derives the next
//! step by replaying that history. A crashed process resumes where the
//! history left off without re-running completed activities.

pub mod activities;
pub mod engine;
pub mod error;
pub mod order_processing;
pub mod retry;
pub mod runtime;
pub mod services;
pub mod state;
pub mod tracker;

pub use activities::{ActivityError, ActivityExecutor, ActivityName};
pub use engine::{Action, Engine, OrchestrationInstance, Replay, replay};
pub use error::OrchestrationError;
pub use retry::RetryPolicy;
pub use runtime::{OrchestrationRuntime, RuntimeConfig};
pub use services::{
    InMemoryNotificationPublisher, InMemoryOrderRepository, NotificationError,
    NotificationEvent, NotificationPublisher, OrderRepository, PersistenceError, SaveOutcome,
};
pub use state::InstanceState;
pub use tracker::{InstanceStatus, InstanceTracker};
