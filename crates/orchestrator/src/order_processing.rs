//! Order processing workflow constants.

use std::fmt::Display;

use domain::OrderId;

/// The orchestration name used in logs and metrics.
pub const ORCHESTRATION_NAME: &str = "ProcessOrder";

/// Failure reason when the validation step rejects the order.
pub const VALIDATION_FAILED: &str = "Order validation failed";

/// Failure reason recorded when an instance is cancelled.
pub const CANCELLED: &str = "cancelled";

/// Output of a successfully processed order.
pub fn completed_output(order_id: OrderId) -> String {
    format!("Order {order_id} processed successfully")
}

/// Failure reason for faults raised while processing.
pub fn error_reason(detail: impl Display) -> String {
    format!("Error processing order: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let id = OrderId::new();
        assert_eq!(
            completed_output(id),
            format!("Order {id} processed successfully")
        );
        assert_eq!(
            error_reason("SaveOrder: disk full"),
            "Error processing order: SaveOrder: disk full"
        );
    }
}
