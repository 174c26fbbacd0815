//! Domain error types.

use thiserror::Error;

use crate::order::Money;

/// A violated order validity rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// Customer name is blank or missing.
    #[error("CustomerName is required.")]
    CustomerNameRequired,

    /// Order has no items.
    #[error("At least one order item is required.")]
    NoItems,

    /// An item's quantity is zero or negative.
    #[error("Item '{product_name}' must have quantity greater than zero.")]
    InvalidQuantity { product_name: String, quantity: i32 },

    /// An item's unit price is negative.
    #[error("Item '{product_name}' must have a non-negative unit price.")]
    NegativeUnitPrice { product_name: String, price: Money },

    /// The order total is negative.
    #[error("TotalAmount must be non-negative.")]
    NegativeTotal { total: Money },
}
