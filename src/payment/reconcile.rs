//! Payment callback reconciliation.
//!
//! Gateway notifications are at-least-once and can arrive in any order, from
//! the IPN channel and the shopper's browser alike. Every notification is
//! verified, validated server-to-server when it claims a capture, and written
//! to the payment ledger under a unique dedupe key in the same commit as the
//! order transition it causes. A replay finds its key and does nothing.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{IpnPayload, NotificationStatus, PaymentError, PaymentGateway, ValidatedPayment};
use crate::domain::aggregates::{CapturedPayment, Order, OrderStatus};
use crate::domain::events::{DomainEvent, PaymentEvent};
use crate::domain::value_objects::round2;
use crate::publisher::EventPublisher;
use crate::store::{OrderCommit, PaymentDisposition, PaymentRecord, StoreError, StorefrontStore};
use crate::{Result, StorefrontError};

const MAX_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSignature,
    UnknownOrder,
    Malformed,
    GatewayDeclined,
    AmountMismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The order moved (paid, or payment failed).
    Applied,
    /// Already processed; nothing changed.
    Duplicate,
    Rejected(RejectReason),
    /// Money was captured that the order cannot keep.
    RequiresRefund,
    /// Valid but irrelevant to the order's current state.
    Ignored,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Rejected(_) => "rejected",
            Self::RequiresRefund => "requires_refund",
            Self::Ignored => "ignored",
        }
    }
}

#[derive(Clone)]
pub struct PaymentReconciler {
    store: Arc<dyn StorefrontStore>,
    gateway: Arc<dyn PaymentGateway>,
    events: EventPublisher,
}

fn ledger_entry(order: &Order, dedupe_key: String, payload: &IpnPayload, disposition: PaymentDisposition, capture: Option<&ValidatedPayment>) -> PaymentRecord {
    PaymentRecord {
        id: Uuid::now_v7(),
        order_id: Some(order.id()),
        dedupe_key,
        tran_id: order.order_number().to_string(),
        val_id: payload.val_id().map(String::from),
        gateway_status: payload.status().as_str().to_string(),
        disposition,
        amount: capture.map(|c| c.amount),
        currency: capture.map(|c| c.currency.clone()),
        payload: payload.to_json(),
        received_at: Utc::now(),
    }
}

impl PaymentReconciler {
    pub fn new(store: Arc<dyn StorefrontStore>, gateway: Arc<dyn PaymentGateway>, events: EventPublisher) -> Self {
        Self { store, gateway, events }
    }

    #[instrument(skip_all, fields(tran_id = payload.tran_id(), val_id = payload.val_id(), status = %payload.status().as_str()))]
    pub async fn handle(&self, payload: &IpnPayload) -> Result<ReconcileOutcome> {
        if !self.gateway.verify_notification(payload) {
            warn!("payment notification failed signature check");
            return Ok(ReconcileOutcome::Rejected(RejectReason::InvalidSignature));
        }
        let Some(tran_id) = payload.tran_id() else {
            warn!("payment notification without tran_id");
            return Ok(ReconcileOutcome::Rejected(RejectReason::Malformed));
        };
        let Some(order) = self.store.order_by_number(tran_id).await? else {
            warn!("payment notification for unknown order");
            return Ok(ReconcileOutcome::Rejected(RejectReason::UnknownOrder));
        };

        match payload.status() {
            NotificationStatus::Valid => self.capture(order, payload).await,
            NotificationStatus::Failed | NotificationStatus::Cancelled | NotificationStatus::Unattempted | NotificationStatus::Expired => {
                self.failure(order, payload).await
            }
            NotificationStatus::Other(status) => {
                warn!(%status, "unhandled gateway status");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn capture(&self, mut order: Order, payload: &IpnPayload) -> Result<ReconcileOutcome> {
        let Some(val_id) = payload.val_id() else {
            warn!("capture notification without val_id");
            return Ok(ReconcileOutcome::Rejected(RejectReason::Malformed));
        };
        if self.store.payment_record_exists(val_id).await? {
            info!(order_number = order.order_number(), "duplicate capture notification");
            return Ok(ReconcileOutcome::Duplicate);
        }

        let validated = match self.gateway.validate(val_id).await {
            Ok(validated) => validated,
            Err(PaymentError::Declined(reason)) => {
                warn!(%reason, "gateway did not confirm capture");
                return Ok(ReconcileOutcome::Rejected(RejectReason::GatewayDeclined));
            }
            Err(e) => return Err(e.into()),
        };

        let totals = order.totals();
        if validated.tran_id != order.order_number() || round2(validated.amount) != totals.total || validated.currency != totals.currency {
            warn!(
                order_number = order.order_number(),
                expected = %totals.total,
                received = %validated.amount,
                currency = %validated.currency,
                "validated capture does not match order snapshot"
            );
            let record = ledger_entry(&order, val_id.to_string(), payload, PaymentDisposition::Rejected, Some(&validated));
            return self.record_only(record, ReconcileOutcome::Rejected(RejectReason::AmountMismatch)).await;
        }

        for _ in 0..MAX_ATTEMPTS {
            let status = order.status();
            if status.awaits_payment() {
                let expected_version = order.version();
                let mut next = order.clone();
                next.mark_paid(CapturedPayment {
                    val_id: validated.val_id.clone(),
                    bank_tran_id: validated.bank_tran_id.clone(),
                    amount: validated.amount,
                    currency: validated.currency.clone(),
                })?;
                let record = ledger_entry(&order, val_id.to_string(), payload, PaymentDisposition::Applied, Some(&validated));
                match self.store.commit_order(&next, expected_version, OrderCommit { release_stock: false, payment_record: Some(record) }).await {
                    Ok(()) => {
                        info!(order_number = next.order_number(), order_id = %next.id(), "order paid");
                        self.events.publish_all(next.take_events()).await;
                        return Ok(ReconcileOutcome::Applied);
                    }
                    Err(StoreError::Conflict) => {
                        order = self.reload(order.id()).await?;
                        continue;
                    }
                    Err(StoreError::Duplicate(_)) => return Ok(ReconcileOutcome::Duplicate),
                    Err(e) => return Err(e.into()),
                }
            }

            let (disposition, reason) = if status.is_captured() {
                (PaymentDisposition::DuplicateCharge, "order already paid")
            } else {
                (PaymentDisposition::LatePayment, "order no longer payable")
            };
            warn!(order_number = order.order_number(), %status, reason, "capture needs a refund");
            let record = ledger_entry(&order, val_id.to_string(), payload, disposition, Some(&validated));
            let outcome = self.record_only(record, ReconcileOutcome::RequiresRefund).await?;
            if outcome == ReconcileOutcome::RequiresRefund {
                self.events
                    .publish(&DomainEvent::Payment(PaymentEvent::RequiresRefund {
                        order_id: order.id(),
                        order_number: order.order_number().to_string(),
                        val_id: validated.val_id.clone(),
                        amount: validated.amount,
                        reason: reason.to_string(),
                    }))
                    .await;
            }
            return Ok(outcome);
        }
        Err(StorefrontError::Conflict("Order is being updated concurrently, try again".into()))
    }

    async fn failure(&self, mut order: Order, payload: &IpnPayload) -> Result<ReconcileOutcome> {
        let status = payload.status();
        let dedupe_key = format!("{}:{}:{}", order.order_number(), status.as_str(), payload.session_key().unwrap_or("-"));
        if self.store.payment_record_exists(&dedupe_key).await? {
            return Ok(ReconcileOutcome::Duplicate);
        }

        for _ in 0..MAX_ATTEMPTS {
            if order.status() != OrderStatus::PendingPayment {
                info!(order_number = order.order_number(), status = %order.status(), "ignoring failure notification");
                return Ok(ReconcileOutcome::Ignored);
            }
            if let Some(current) = order.gateway_session_key() {
                if payload.session_key() != Some(current) {
                    info!(order_number = order.order_number(), "ignoring failure for a superseded payment session");
                    return Ok(ReconcileOutcome::Ignored);
                }
            }
            let expected_version = order.version();
            let mut next = order.clone();
            next.mark_payment_failed(status.as_str())?;
            let record = ledger_entry(&order, dedupe_key.clone(), payload, PaymentDisposition::Failed, None);
            match self.store.commit_order(&next, expected_version, OrderCommit { release_stock: false, payment_record: Some(record) }).await {
                Ok(()) => {
                    info!(order_number = next.order_number(), "payment failed");
                    self.events.publish_all(next.take_events()).await;
                    return Ok(ReconcileOutcome::Applied);
                }
                Err(StoreError::Conflict) => order = self.reload(order.id()).await?,
                Err(StoreError::Duplicate(_)) => return Ok(ReconcileOutcome::Duplicate),
                Err(e) => return Err(e.into()),
            }
        }
        Err(StorefrontError::Conflict("Order is being updated concurrently, try again".into()))
    }

    async fn record_only(&self, record: PaymentRecord, outcome: ReconcileOutcome) -> Result<ReconcileOutcome> {
        match self.store.insert_payment_record(&record).await {
            Ok(()) => Ok(outcome),
            Err(StoreError::Duplicate(_)) => Ok(ReconcileOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    async fn reload(&self, order_id: Uuid) -> Result<Order> {
        self.store.order(order_id).await?.ok_or(StorefrontError::NotFound("Order"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{ContactInfo, OrderLine, PaymentStatus, Product, ShippingAddress};
    use crate::domain::pricing::PricingPolicy;
    use crate::domain::value_objects::Sku;
    use crate::payment::fake::FakeGateway;
    use crate::store::{MemoryStore, PlaceOrderOutcome};
    use rust_decimal::Decimal;

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: Arc<FakeGateway>,
        reconciler: PaymentReconciler,
        order: Order,
        product_id: Uuid,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let mut product = Product::create(Sku::generate(), "Silk Saree", Decimal::new(2500, 0)).unwrap();
        product.publish().unwrap();
        product.stock = 5;
        store.insert_product(&product).await.unwrap();

        let line = OrderLine::new(product.id, None, product.name.clone(), None, product.sku.to_string(), 1, product.price);
        let totals = PricingPolicy::default().totals([(line.unit_price, line.quantity)]);
        let order = Order::place(Uuid::now_v7(), ContactInfo::default(), ShippingAddress::default(), vec![line], totals, None).unwrap();
        assert!(matches!(store.place_order(&order, Uuid::nil()).await.unwrap(), PlaceOrderOutcome::Placed));

        let reconciler = PaymentReconciler::new(store.clone(), gateway.clone(), EventPublisher::disabled());
        Harness { store, gateway, reconciler, order, product_id: product.id }
    }

    impl Harness {
        async fn current(&self) -> Order { self.store.order(self.order.id()).await.unwrap().unwrap() }

        fn confirm(&self, val_id: &str, amount: Decimal) {
            self.gateway.confirm(val_id, self.order.order_number(), amount, "BDT");
        }

        async fn dispositions(&self) -> Vec<PaymentDisposition> {
            self.store.payment_records(self.order.id()).await.unwrap().into_iter().map(|r| r.disposition).collect()
        }
    }

    #[tokio::test]
    async fn valid_capture_pays_once() {
        let h = harness().await;
        h.confirm("VAL-1", h.order.totals().total);
        let ipn = FakeGateway::notification("VALID", h.order.order_number(), Some("VAL-1"));

        assert_eq!(h.reconciler.handle(&ipn).await.unwrap(), ReconcileOutcome::Applied);
        let paid = h.current().await;
        assert_eq!(paid.status(), OrderStatus::Paid);
        assert_eq!(paid.payment_status(), PaymentStatus::Paid);
        assert_eq!(paid.payment().unwrap().bank_tran_id.as_deref(), Some("BANK-VAL-1"));

        // Browser return replays the same notification.
        assert_eq!(h.reconciler.handle(&ipn).await.unwrap(), ReconcileOutcome::Duplicate);
        assert_eq!(h.current().await.version(), paid.version());
        assert_eq!(h.dispositions().await, vec![PaymentDisposition::Applied]);
    }

    #[tokio::test]
    async fn bad_signature_changes_nothing() {
        let h = harness().await;
        h.confirm("VAL-1", h.order.totals().total);
        let mut ipn = FakeGateway::notification("VALID", h.order.order_number(), Some("VAL-1"));
        ipn.0.insert("verify_sign".into(), "forged".into());

        assert_eq!(h.reconciler.handle(&ipn).await.unwrap(), ReconcileOutcome::Rejected(RejectReason::InvalidSignature));
        assert_eq!(h.current().await.status(), OrderStatus::PendingPayment);
        assert!(h.dispositions().await.is_empty());
    }

    #[tokio::test]
    async fn short_payment_is_rejected_and_recorded() {
        let h = harness().await;
        h.confirm("VAL-1", h.order.totals().total - Decimal::ONE);
        let ipn = FakeGateway::notification("VALID", h.order.order_number(), Some("VAL-1"));

        assert_eq!(h.reconciler.handle(&ipn).await.unwrap(), ReconcileOutcome::Rejected(RejectReason::AmountMismatch));
        assert_eq!(h.current().await.status(), OrderStatus::PendingPayment);
        assert_eq!(h.dispositions().await, vec![PaymentDisposition::Rejected]);
        assert_eq!(h.reconciler.handle(&ipn).await.unwrap(), ReconcileOutcome::Duplicate);
    }

    #[tokio::test]
    async fn unconfirmed_capture_is_rejected() {
        let h = harness().await;
        let ipn = FakeGateway::notification("VALID", h.order.order_number(), Some("VAL-UNKNOWN"));
        assert_eq!(h.reconciler.handle(&ipn).await.unwrap(), ReconcileOutcome::Rejected(RejectReason::GatewayDeclined));
        assert_eq!(h.current().await.status(), OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn second_capture_requires_refund() {
        let h = harness().await;
        let total = h.order.totals().total;
        h.confirm("VAL-1", total);
        h.confirm("VAL-2", total);
        h.reconciler.handle(&FakeGateway::notification("VALID", h.order.order_number(), Some("VAL-1"))).await.unwrap();

        let second = FakeGateway::notification("VALID", h.order.order_number(), Some("VAL-2"));
        assert_eq!(h.reconciler.handle(&second).await.unwrap(), ReconcileOutcome::RequiresRefund);
        assert_eq!(h.current().await.payment().unwrap().val_id, "VAL-1");
        assert_eq!(h.dispositions().await, vec![PaymentDisposition::Applied, PaymentDisposition::DuplicateCharge]);
    }

    #[tokio::test]
    async fn payment_for_cancelled_order_is_late() {
        let h = harness().await;
        let mut cancelled = h.current().await;
        cancelled.cancel("customer request").unwrap();
        h.store.commit_order(&cancelled, 0, OrderCommit { release_stock: true, payment_record: None }).await.unwrap();
        h.confirm("VAL-1", h.order.totals().total);

        let ipn = FakeGateway::notification("VALID", h.order.order_number(), Some("VAL-1"));
        assert_eq!(h.reconciler.handle(&ipn).await.unwrap(), ReconcileOutcome::RequiresRefund);
        assert_eq!(h.current().await.status(), OrderStatus::Cancelled);
        assert_eq!(h.dispositions().await, vec![PaymentDisposition::LatePayment]);
        assert_eq!(h.store.product(h.product_id).await.unwrap().unwrap().stock, 5);
    }

    #[tokio::test]
    async fn failure_then_retry_then_success() {
        let h = harness().await;
        let failed = FakeGateway::notification("FAILED", h.order.order_number(), None);
        assert_eq!(h.reconciler.handle(&failed).await.unwrap(), ReconcileOutcome::Applied);
        assert_eq!(h.current().await.status(), OrderStatus::PaymentFailed);
        assert_eq!(h.reconciler.handle(&failed).await.unwrap(), ReconcileOutcome::Duplicate);

        h.confirm("VAL-1", h.order.totals().total);
        let ipn = FakeGateway::notification("VALID", h.order.order_number(), Some("VAL-1"));
        assert_eq!(h.reconciler.handle(&ipn).await.unwrap(), ReconcileOutcome::Applied);
        assert_eq!(h.current().await.status(), OrderStatus::Paid);

        let late_cancel = FakeGateway::notification("CANCELLED", h.order.order_number(), None);
        assert_eq!(h.reconciler.handle(&late_cancel).await.unwrap(), ReconcileOutcome::Ignored);
    }

    #[tokio::test]
    async fn failures_from_an_older_session_are_ignored() {
        let h = harness().await;
        let mut retried = h.current().await;
        retried.begin_payment("SESSION-2").unwrap();
        h.store.commit_order(&retried, h.order.version(), OrderCommit::default()).await.unwrap();

        let stale = FakeGateway::notification("FAILED", h.order.order_number(), None);
        assert_eq!(h.reconciler.handle(&stale).await.unwrap(), ReconcileOutcome::Ignored);
        assert_eq!(h.current().await.status(), OrderStatus::PendingPayment);

        let mut current = FakeGateway::notification("FAILED", h.order.order_number(), None);
        current.0.insert("sessionkey".into(), "SESSION-2".into());
        assert_eq!(h.reconciler.handle(&current).await.unwrap(), ReconcileOutcome::Applied);
        assert_eq!(h.current().await.status(), OrderStatus::PaymentFailed);
    }

    #[tokio::test]
    async fn unknown_order_is_rejected() {
        let h = harness().await;
        let ipn = FakeGateway::notification("VALID", "ORD-99999999", Some("VAL-1"));
        assert_eq!(h.reconciler.handle(&ipn).await.unwrap(), ReconcileOutcome::Rejected(RejectReason::UnknownOrder));
    }
}
