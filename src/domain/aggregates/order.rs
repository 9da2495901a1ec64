//! Order Aggregate
//!
//! An order is an immutable snapshot of a priced cart plus a status that only
//! moves along the transitions allowed by [`OrderStatus::can_transition_to`].
//! Persistence is optimistic: `version` is the value read from storage, and
//! every commit must present it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::events::{DomainEvent, OrderEvent};
use crate::domain::pricing::OrderTotals;
use crate::domain::value_objects::round2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    PaymentFailed,
    Fulfilled,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        Self::PendingPayment, Self::Paid, Self::PaymentFailed, Self::Fulfilled,
        Self::Delivered, Self::Cancelled, Self::Refunded,
    ];

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (PendingPayment, Paid | PaymentFailed | Cancelled)
                | (PaymentFailed, PendingPayment | Paid | Cancelled)
                | (Paid, Fulfilled | Refunded)
                | (Fulfilled, Delivered | Refunded)
                | (Delivered, Refunded)
        )
    }

    /// Still waiting on the customer to pay; stock is reserved.
    pub fn awaits_payment(self) -> bool { matches!(self, Self::PendingPayment | Self::PaymentFailed) }

    /// Money has been captured and not returned.
    pub fn is_captured(self) -> bool { matches!(self, Self::Paid | Self::Fulfilled | Self::Delivered) }

    pub fn is_terminal(self) -> bool { matches!(self, Self::Cancelled | Self::Refunded) }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Paid => "paid",
            Self::PaymentFailed => "payment_failed",
            Self::Fulfilled => "fulfilled",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> { Self::ALL.into_iter().find(|st| st.as_str() == s) }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus { Unpaid, Paid, Failed, Refunded }

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self { Self::Unpaid => "unpaid", Self::Paid => "paid", Self::Failed => "failed", Self::Refunded => "refunded" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s { "unpaid" => Some(Self::Unpaid), "paid" => Some(Self::Paid), "failed" => Some(Self::Failed), "refunded" => Some(Self::Refunded), _ => None }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub product_name: String,
    pub variant_label: Option<String>,
    pub sku: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

impl OrderLine {
    pub fn new(product_id: Uuid, variant_id: Option<Uuid>, product_name: String, variant_label: Option<String>, sku: String, quantity: u32, unit_price: Decimal) -> Self {
        let unit_price = round2(unit_price);
        Self { id: Uuid::now_v7(), product_id, variant_id, product_name, variant_label, sku, quantity, unit_price, line_total: round2(unit_price * Decimal::from(quantity)) }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub recipient_name: String,
    pub phone_number: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: Option<String>,
    pub zip_code: String,
    pub country: String,
    pub delivery_instructions: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Proof of a captured payment, as confirmed by the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapturedPayment {
    pub val_id: String,
    pub bank_tran_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
}

/// Side effect on reserved inventory that a transition demands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StockEffect { Keep, Release }

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub(crate) id: Uuid,
    pub(crate) order_number: String,
    pub(crate) customer_id: Option<Uuid>,
    pub(crate) contact: ContactInfo,
    pub(crate) shipping_address: ShippingAddress,
    pub(crate) status: OrderStatus,
    pub(crate) payment_status: PaymentStatus,
    pub(crate) items: Vec<OrderLine>,
    pub(crate) totals: OrderTotals,
    pub(crate) gateway_session_key: Option<String>,
    pub(crate) payment: Option<CapturedPayment>,
    pub(crate) tracking_number: Option<String>,
    pub(crate) status_reason: Option<String>,
    pub(crate) refund_ref: Option<String>,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) version: i64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) paid_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) events: Vec<DomainEvent>,
}

impl Order {
    /// Snapshots priced lines into a new order awaiting payment.
    pub fn place(
        customer_id: Uuid,
        contact: ContactInfo,
        shipping_address: ShippingAddress,
        items: Vec<OrderLine>,
        totals: OrderTotals,
        idempotency_key: Option<String>,
    ) -> Result<Self, OrderError> {
        if items.is_empty() { return Err(OrderError::NoItems); }
        let line_sum: Decimal = items.iter().map(|l| l.line_total).sum();
        if line_sum != totals.subtotal { return Err(OrderError::TotalsMismatch); }
        let now = Utc::now();
        let id = Uuid::now_v7();
        let order_number = format!("ORD-{:08}", rand::random::<u32>() % 100_000_000);
        let mut order = Self {
            id, order_number, customer_id: Some(customer_id), contact, shipping_address,
            status: OrderStatus::PendingPayment, payment_status: PaymentStatus::Unpaid,
            items, totals, gateway_session_key: None, payment: None, tracking_number: None,
            status_reason: None, refund_ref: None, idempotency_key, version: 0,
            created_at: now, updated_at: now, paid_at: None, events: vec![],
        };
        order.raise_event(OrderEvent::Placed {
            order_id: id, order_number: order.order_number.clone(), customer_id: Some(customer_id),
            total: order.totals.total, currency: order.totals.currency.clone(),
        });
        Ok(order)
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn order_number(&self) -> &str { &self.order_number }
    pub fn customer_id(&self) -> Option<Uuid> { self.customer_id }
    pub fn contact(&self) -> &ContactInfo { &self.contact }
    pub fn shipping_address(&self) -> &ShippingAddress { &self.shipping_address }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn payment_status(&self) -> PaymentStatus { self.payment_status }
    pub fn items(&self) -> &[OrderLine] { &self.items }
    pub fn totals(&self) -> &OrderTotals { &self.totals }
    pub fn gateway_session_key(&self) -> Option<&str> { self.gateway_session_key.as_deref() }
    pub fn payment(&self) -> Option<&CapturedPayment> { self.payment.as_ref() }
    pub fn tracking_number(&self) -> Option<&str> { self.tracking_number.as_deref() }
    pub fn status_reason(&self) -> Option<&str> { self.status_reason.as_deref() }
    pub fn refund_ref(&self) -> Option<&str> { self.refund_ref.as_deref() }
    pub fn idempotency_key(&self) -> Option<&str> { self.idempotency_key.as_deref() }
    pub fn version(&self) -> i64 { self.version }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }
    pub fn paid_at(&self) -> Option<DateTime<Utc>> { self.paid_at }
    pub fn is_owned_by(&self, customer_id: Uuid) -> bool { self.customer_id == Some(customer_id) }

    /// Opens (or reopens after a failure) a gateway payment session.
    pub fn begin_payment(&mut self, session_key: impl Into<String>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::PendingPayment => {}
            OrderStatus::PaymentFailed => {
                self.transition(OrderStatus::PendingPayment)?;
                self.payment_status = PaymentStatus::Unpaid;
            }
            s if s.is_captured() => return Err(OrderError::AlreadyPaid),
            s => return Err(OrderError::InvalidTransition { from: s, to: OrderStatus::PendingPayment }),
        }
        self.gateway_session_key = Some(session_key.into());
        self.touch();
        Ok(())
    }

    /// Records a gateway-confirmed capture. The captured amount must equal the snapshot total.
    pub fn mark_paid(&mut self, payment: CapturedPayment) -> Result<(), OrderError> {
        if self.status.is_captured() { return Err(OrderError::AlreadyPaid); }
        if payment.currency != self.totals.currency || round2(payment.amount) != self.totals.total {
            return Err(OrderError::AmountMismatch { expected: self.totals.total, received: payment.amount });
        }
        self.transition(OrderStatus::Paid)?;
        self.payment_status = PaymentStatus::Paid;
        self.paid_at = Some(Utc::now());
        self.status_reason = None;
        self.raise_event(OrderEvent::Paid {
            order_id: self.id, order_number: self.order_number.clone(), val_id: payment.val_id.clone(), amount: payment.amount,
        });
        self.payment = Some(payment);
        Ok(())
    }

    pub fn mark_payment_failed(&mut self, reason: impl Into<String>) -> Result<(), OrderError> {
        let reason = reason.into();
        self.transition(OrderStatus::PaymentFailed)?;
        self.payment_status = PaymentStatus::Failed;
        self.status_reason = Some(reason.clone());
        self.raise_event(OrderEvent::PaymentFailed { order_id: self.id, order_number: self.order_number.clone(), reason });
        Ok(())
    }

    /// Cancels an order that has not been paid. Reserved stock goes back.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<StockEffect, OrderError> {
        if self.status.is_captured() { return Err(OrderError::RefundRequired); }
        let reason = reason.into();
        self.transition(OrderStatus::Cancelled)?;
        self.status_reason = Some(reason.clone());
        self.raise_event(OrderEvent::Cancelled { order_id: self.id, order_number: self.order_number.clone(), reason });
        Ok(StockEffect::Release)
    }

    pub fn ship(&mut self, tracking: Option<String>) -> Result<(), OrderError> {
        self.transition(OrderStatus::Fulfilled)?;
        self.tracking_number = tracking.clone();
        self.raise_event(OrderEvent::Shipped { order_id: self.id, order_number: self.order_number.clone(), tracking });
        Ok(())
    }

    pub fn deliver(&mut self) -> Result<(), OrderError> {
        self.transition(OrderStatus::Delivered)?;
        self.raise_event(OrderEvent::Delivered { order_id: self.id, order_number: self.order_number.clone() });
        Ok(())
    }

    /// Full refund of a captured order. Only unshipped goods return to stock.
    pub fn refund(&mut self, refund_ref: impl Into<String>) -> Result<StockEffect, OrderError> {
        let refund_ref = refund_ref.into();
        let effect = if self.status == OrderStatus::Paid { StockEffect::Release } else { StockEffect::Keep };
        self.transition(OrderStatus::Refunded)?;
        self.payment_status = PaymentStatus::Refunded;
        self.refund_ref = Some(refund_ref.clone());
        self.raise_event(OrderEvent::Refunded { order_id: self.id, order_number: self.order_number.clone(), amount: self.totals.total, refund_ref });
        Ok(effect)
    }

    /// Whether the payment window opened at placement has elapsed.
    pub fn payment_window_elapsed(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status.awaits_payment() && now - self.created_at >= window
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }

    /// Called by storage after a successful compare-and-swap.
    pub(crate) fn mark_committed(&mut self) { self.version += 1; }

    fn transition(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    fn raise_event(&mut self, e: OrderEvent) { self.events.push(DomainEvent::Order(e)); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("No items")]
    NoItems,
    #[error("Line totals do not add up to the order subtotal")]
    TotalsMismatch,
    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("Order is already paid")]
    AlreadyPaid,
    #[error("Order has been paid; refund it instead")]
    RefundRequired,
    #[error("Paid amount {received} does not match order total {expected}")]
    AmountMismatch { expected: Decimal, received: Decimal },
    #[error("Payment window has expired")]
    PaymentWindowExpired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pricing::PricingPolicy;

    fn sample_order() -> Order {
        let line = OrderLine::new(Uuid::now_v7(), None, "Widget".into(), None, "W001".into(), 2, Decimal::new(10, 0));
        let totals = PricingPolicy::default().totals([(line.unit_price, line.quantity)]);
        Order::place(Uuid::now_v7(), ContactInfo::default(), ShippingAddress::default(), vec![line], totals, None).unwrap()
    }

    fn capture(order: &Order, val_id: &str) -> CapturedPayment {
        CapturedPayment { val_id: val_id.into(), bank_tran_id: Some("BANK1".into()), amount: order.totals().total, currency: "BDT".into() }
    }

    #[test]
    fn test_order_workflow() {
        let mut order = sample_order();
        assert_eq!(order.status(), OrderStatus::PendingPayment);
        assert_eq!(order.totals().total, Decimal::new(80, 0));
        order.begin_payment("SESSION1").unwrap();
        order.mark_paid(capture(&order, "VAL1")).unwrap();
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        order.ship(Some("TRACK-1".into())).unwrap();
        order.deliver().unwrap();
        assert_eq!(order.status(), OrderStatus::Delivered);
        let kinds: Vec<_> = order.take_events().iter().map(|e| e.subject()).collect();
        assert_eq!(kinds, ["storefront.order.placed", "storefront.order.paid", "storefront.order.shipped", "storefront.order.delivered"]);
    }

    #[test]
    fn test_transition_table() {
        use OrderStatus::*;
        let allowed = [
            (PendingPayment, Paid), (PendingPayment, PaymentFailed), (PendingPayment, Cancelled),
            (PaymentFailed, PendingPayment), (PaymentFailed, Paid), (PaymentFailed, Cancelled),
            (Paid, Fulfilled), (Paid, Refunded), (Fulfilled, Delivered), (Fulfilled, Refunded), (Delivered, Refunded),
        ];
        for from in OrderStatus::ALL {
            for to in OrderStatus::ALL {
                assert_eq!(from.can_transition_to(to), allowed.contains(&(from, to)), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_paid_order_cannot_be_paid_again() {
        let mut order = sample_order();
        order.mark_paid(capture(&order, "VAL1")).unwrap();
        assert_eq!(order.mark_paid(capture(&order, "VAL2")), Err(OrderError::AlreadyPaid));
        assert_eq!(order.begin_payment("S2"), Err(OrderError::AlreadyPaid));
        assert_eq!(order.payment().unwrap().val_id, "VAL1");
    }

    #[test]
    fn test_amount_must_match_snapshot() {
        let mut order = sample_order();
        let mut short = capture(&order, "VAL1");
        short.amount -= Decimal::ONE;
        assert!(matches!(order.mark_paid(short), Err(OrderError::AmountMismatch { .. })));
        let mut foreign = capture(&order, "VAL1");
        foreign.currency = "USD".into();
        assert!(matches!(order.mark_paid(foreign), Err(OrderError::AmountMismatch { .. })));
        assert_eq!(order.status(), OrderStatus::PendingPayment);
    }

    #[test]
    fn test_failed_payment_can_be_retried() {
        let mut order = sample_order();
        order.mark_payment_failed("FAILED").unwrap();
        assert_eq!(order.payment_status(), PaymentStatus::Failed);
        order.begin_payment("S2").unwrap();
        assert_eq!(order.status(), OrderStatus::PendingPayment);
        assert_eq!(order.gateway_session_key(), Some("S2"));
    }

    #[test]
    fn test_cancel_releases_stock_only_before_payment() {
        let mut order = sample_order();
        assert_eq!(order.cancel("changed mind"), Ok(StockEffect::Release));
        assert!(order.status().is_terminal());

        let mut paid = sample_order();
        paid.mark_paid(capture(&paid, "VAL1")).unwrap();
        assert_eq!(paid.cancel("too late"), Err(OrderError::RefundRequired));
    }

    #[test]
    fn test_refund_restocks_only_unshipped_orders() {
        let mut paid = sample_order();
        paid.mark_paid(capture(&paid, "VAL1")).unwrap();
        assert_eq!(paid.refund("R1"), Ok(StockEffect::Release));

        let mut shipped = sample_order();
        shipped.mark_paid(capture(&shipped, "VAL1")).unwrap();
        shipped.ship(None).unwrap();
        assert_eq!(shipped.refund("R2"), Ok(StockEffect::Keep));
        assert_eq!(shipped.payment_status(), PaymentStatus::Refunded);
    }

    #[test]
    fn test_unpaid_order_cannot_ship() {
        let mut order = sample_order();
        assert_eq!(
            order.ship(None),
            Err(OrderError::InvalidTransition { from: OrderStatus::PendingPayment, to: OrderStatus::Fulfilled })
        );
    }

    #[test]
    fn test_payment_window() {
        let order = sample_order();
        let window = chrono::Duration::minutes(30);
        assert!(!order.payment_window_elapsed(window, order.created_at() + chrono::Duration::minutes(29)));
        assert!(order.payment_window_elapsed(window, order.created_at() + chrono::Duration::minutes(30)));
    }
}
