//! Domain layer for the order orchestrator.
//!
//! This crate provides the order model that flows through the saga:
//! - `NewOrder`, the input shape accepted from callers (id and timestamp optional)
//! - `Order`, the immutable input of an orchestration instance
//! - `Money`, `OrderId`, `ProductId` value objects
//! - The validity rules applied by the validation step

pub mod error;
pub mod order;

pub use error::OrderError;
pub use order::{Money, NewOrder, Order, OrderId, OrderItem, ProductId};
