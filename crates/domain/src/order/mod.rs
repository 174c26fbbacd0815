//! Order model and validity rules.

mod model;
mod value_objects;

pub use model::{NewOrder, Order};
pub use value_objects::{Money, OrderId, OrderItem, ProductId};
