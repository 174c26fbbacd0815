//! The order carried through the saga.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value_objects::{Money, OrderId, OrderItem};
use crate::error::OrderError;

/// An order as submitted by a caller.
///
/// Field names are accepted in camelCase, snake_case or PascalCase.
///
/// The identifier and creation time are optional and filled in when an
/// orchestration instance is created. Customer name and items default to
/// empty so that incomplete orders still become instances and are rejected
/// by the validation step rather than at the boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    #[serde(default, alias = "Id")]
    pub id: Option<OrderId>,

    #[serde(default, alias = "customer_name", alias = "CustomerName")]
    pub customer_name: Option<String>,

    #[serde(default, alias = "Items")]
    pub items: Option<Vec<OrderItem>>,

    #[serde(default, alias = "total_amount", alias = "TotalAmount")]
    pub total_amount: Money,

    #[serde(default, alias = "created_at", alias = "CreatedAt")]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewOrder {
    /// Completes the order, generating an id if absent (or nil) and using
    /// `now` as the creation time if none was given.
    pub fn into_order(self, now: DateTime<Utc>) -> Order {
        Order {
            id: self.id.filter(|id| !id.is_nil()).unwrap_or_default(),
            customer_name: self.customer_name.unwrap_or_default(),
            items: self.items.unwrap_or_default(),
            total_amount: self.total_amount,
            created_at: self.created_at.unwrap_or(now),
        }
    }
}

/// The immutable input of an orchestration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub customer_name: String,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Returns every violated validity rule, in a stable order.
    pub fn validate(&self) -> Vec<OrderError> {
        let mut errors = Vec::new();

        if self.customer_name.trim().is_empty() {
            errors.push(OrderError::CustomerNameRequired);
        }

        if self.items.is_empty() {
            errors.push(OrderError::NoItems);
        }

        for item in &self.items {
            if item.quantity <= 0 {
                errors.push(OrderError::InvalidQuantity {
                    product_name: item.product_name.clone(),
                    quantity: item.quantity,
                });
            }
            if item.unit_price.is_negative() {
                errors.push(OrderError::NegativeUnitPrice {
                    product_name: item.product_name.clone(),
                    price: item.unit_price,
                });
            }
        }

        if self.total_amount.is_negative() {
            errors.push(OrderError::NegativeTotal {
                total: self.total_amount,
            });
        }

        errors
    }

    /// Returns true if the order satisfies every validity rule.
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}
