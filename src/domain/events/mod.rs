//! Domain events
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "aggregate", content = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Customer(CustomerEvent),
    Order(OrderEvent),
    Payment(PaymentEvent),
    Inventory(InventoryEvent),
}

impl DomainEvent {
    /// NATS subject, e.g. `storefront.order.paid`.
    pub fn subject(&self) -> String {
        let (aggregate, name) = match self {
            Self::Customer(e) => ("customer", e.name()),
            Self::Order(e) => ("order", e.name()),
            Self::Payment(e) => ("payment", e.name()),
            Self::Inventory(e) => ("inventory", e.name()),
        };
        format!("storefront.{aggregate}.{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CustomerEvent {
    Registered { customer_id: Uuid, email: String, display_name: String },
    PasswordResetRequested { customer_id: Uuid, email: String, token: String },
    EmailVerificationRequested { customer_id: Uuid, email: String, token: String },
}

impl CustomerEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::PasswordResetRequested { .. } => "password_reset_requested",
            Self::EmailVerificationRequested { .. } => "email_verification_requested",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed { order_id: Uuid, order_number: String, customer_id: Option<Uuid>, total: Decimal, currency: String },
    Paid { order_id: Uuid, order_number: String, val_id: String, amount: Decimal },
    PaymentFailed { order_id: Uuid, order_number: String, reason: String },
    Cancelled { order_id: Uuid, order_number: String, reason: String },
    Shipped { order_id: Uuid, order_number: String, tracking: Option<String> },
    Delivered { order_id: Uuid, order_number: String },
    Refunded { order_id: Uuid, order_number: String, amount: Decimal, refund_ref: String },
}

impl OrderEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Placed { .. } => "placed",
            Self::Paid { .. } => "paid",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Shipped { .. } => "shipped",
            Self::Delivered { .. } => "delivered",
            Self::Refunded { .. } => "refunded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEvent {
    /// A capture landed on an order that can no longer take it.
    RequiresRefund { order_id: Uuid, order_number: String, val_id: String, amount: Decimal, reason: String },
}

impl PaymentEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::RequiresRefund { .. } => "requires_refund",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InventoryEvent {
    StockReleased { order_id: Uuid, lines: usize },
}

impl InventoryEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::StockReleased { .. } => "stock_released",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_namespaced() {
        let event = DomainEvent::Order(OrderEvent::Delivered { order_id: Uuid::nil(), order_number: "ORD-1".into() });
        assert_eq!(event.subject(), "storefront.order.delivered");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = DomainEvent::Inventory(InventoryEvent::StockReleased { order_id: Uuid::nil(), lines: 2 });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["aggregate"], "inventory");
        assert_eq!(json["event"]["type"], "stock_released");
    }
}
