//! Order lifecycle after placement: payment initiation, customer and staff
//! transitions, refunds and the payment-window sweeper.
//!
//! Every transition goes through [`OrderService::transition`], which reloads
//! the order on a version conflict and re-applies the change, so a concurrent
//! writer can never be overwritten.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::aggregates::{CapturedPayment, Order, OrderError, OrderStatus, StockEffect};
use crate::domain::events::{DomainEvent, InventoryEvent};
use crate::payment::{GatewaySession, PaymentGateway, SessionUrls};
use crate::publisher::EventPublisher;
use crate::store::{OrderCommit, OrderQuery, Page, PaymentDisposition, PaymentRecord, StoreError, StorefrontStore};
use crate::{Result, StorefrontError};

const MAX_ATTEMPTS: usize = 3;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Serialize)]
pub struct PaymentRedirect {
    pub order_id: Uuid,
    pub order_number: String,
    #[serde(flatten)]
    pub session: GatewaySession,
}

#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn StorefrontStore>,
    gateway: Arc<dyn PaymentGateway>,
    events: EventPublisher,
    urls: SessionUrls,
    payment_window: chrono::Duration,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn StorefrontStore>,
        gateway: Arc<dyn PaymentGateway>,
        events: EventPublisher,
        urls: SessionUrls,
        payment_window: chrono::Duration,
    ) -> Self {
        Self { store, gateway, events, urls, payment_window }
    }

    async fn load(&self, order_id: Uuid) -> Result<Order> {
        self.store.order(order_id).await?.ok_or(StorefrontError::NotFound("Order"))
    }

    /// Someone else's order reads as missing.
    async fn load_owned(&self, customer_id: Uuid, order_id: Uuid) -> Result<Order> {
        match self.store.order(order_id).await? {
            Some(order) if order.is_owned_by(customer_id) => Ok(order),
            _ => Err(StorefrontError::NotFound("Order")),
        }
    }

    /// Applies `change` and commits with a version check, retrying on conflict.
    async fn transition<F>(&self, mut order: Order, mut change: F) -> Result<Order>
    where
        F: FnMut(&mut Order) -> std::result::Result<StockEffect, OrderError>,
    {
        for _ in 0..MAX_ATTEMPTS {
            let expected_version = order.version();
            let mut next = order.clone();
            let effect = change(&mut next)?;
            let release_stock = effect == StockEffect::Release;
            match self.store.commit_order(&next, expected_version, OrderCommit { release_stock, payment_record: None }).await {
                Ok(()) => {
                    next.mark_committed();
                    let mut events = next.take_events();
                    if release_stock {
                        events.push(DomainEvent::Inventory(InventoryEvent::StockReleased { order_id: next.id(), lines: next.items().len() }));
                    }
                    self.events.publish_all(events).await;
                    return Ok(next);
                }
                Err(StoreError::Conflict) => {
                    warn!(order_id = %order.id(), "order changed concurrently, retrying");
                    order = self.load(order.id()).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StorefrontError::Conflict("Order is being updated concurrently, try again".into()))
    }

    // --- customer ---

    pub async fn list_for_customer(&self, customer_id: Uuid, query: OrderQuery) -> Result<Page<Order>> {
        Ok(self.store.list_orders(&OrderQuery { customer_id: Some(customer_id), ..query }).await?)
    }

    pub async fn get_for_customer(&self, customer_id: Uuid, order_id: Uuid) -> Result<Order> {
        self.load_owned(customer_id, order_id).await
    }

    #[instrument(skip(self))]
    pub async fn cancel_by_customer(&self, customer_id: Uuid, order_id: Uuid) -> Result<Order> {
        let order = self.load_owned(customer_id, order_id).await?;
        let order = self.transition(order, |o| o.cancel("Cancelled by customer")).await?;
        info!(order_number = order.order_number(), "order cancelled by customer");
        Ok(order)
    }

    /// Opens a gateway session for an unpaid order. A failed payment may be retried.
    #[instrument(skip(self))]
    pub async fn initiate_payment(&self, customer_id: Uuid, order_id: Uuid) -> Result<PaymentRedirect> {
        let order = self.load_owned(customer_id, order_id).await?;
        let status = order.status();
        if status.is_captured() {
            return Err(OrderError::AlreadyPaid.into());
        }
        if !status.awaits_payment() {
            return Err(OrderError::InvalidTransition { from: status, to: OrderStatus::PendingPayment }.into());
        }
        if order.payment_window_elapsed(self.payment_window, Utc::now()) {
            return Err(OrderError::PaymentWindowExpired.into());
        }

        let session = self.gateway.create_session(&order, &self.urls).await.map_err(|e| {
            error!(order_number = order.order_number(), error = %e, "failed to open payment session");
            e
        })?;
        let session_key = session.session_key.clone();
        let order = self
            .transition(order, |o| {
                o.begin_payment(session_key.clone())?;
                Ok(StockEffect::Keep)
            })
            .await?;
        info!(order_number = order.order_number(), "payment session opened");
        Ok(PaymentRedirect { order_id: order.id(), order_number: order.order_number().to_string(), session })
    }

    // --- staff ---

    pub async fn list(&self, query: &OrderQuery) -> Result<Page<Order>> {
        Ok(self.store.list_orders(query).await?)
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Order> { self.load(order_id).await }

    #[instrument(skip(self))]
    pub async fn ship(&self, order_id: Uuid, tracking_number: Option<String>) -> Result<Order> {
        let order = self.load(order_id).await?;
        self.transition(order, |o| {
            o.ship(tracking_number.clone())?;
            Ok(StockEffect::Keep)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn deliver(&self, order_id: Uuid) -> Result<Order> {
        let order = self.load(order_id).await?;
        self.transition(order, |o| {
            o.deliver()?;
            Ok(StockEffect::Keep)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, order_id: Uuid, reason: &str) -> Result<Order> {
        let order = self.load(order_id).await?;
        self.transition(order, |o| o.cancel(reason)).await
    }

    /// Full refund through the gateway, then the `refunded` transition.
    ///
    /// The refund is claimed in the payment ledger under `refund:<order id>`
    /// before the gateway is called, so a second concurrent refund is turned
    /// away instead of paying out twice. A gateway failure drops the claim.
    #[instrument(skip(self))]
    pub async fn refund(&self, order_id: Uuid, remarks: &str) -> Result<Order> {
        let order = self.load(order_id).await?;
        if !order.status().is_captured() {
            return Err(OrderError::InvalidTransition { from: order.status(), to: OrderStatus::Refunded }.into());
        }
        let (val_id, bank_tran_id) = match order.payment() {
            Some(CapturedPayment { val_id, bank_tran_id: Some(bank_tran_id), .. }) => (val_id.clone(), bank_tran_id.clone()),
            _ => return Err(StorefrontError::Conflict("Order has no gateway transaction to refund".into())),
        };

        let claim = refund_claim(&order, &val_id, remarks);
        match self.store.insert_payment_record(&claim).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                return Err(StorefrontError::Conflict("A refund for this order is already in progress".into()));
            }
            Err(e) => return Err(e.into()),
        }

        let receipt = match self.gateway.refund(&bank_tran_id, order.totals().total, remarks).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(order_number = order.order_number(), error = %e, "gateway refund failed");
                if let Err(cleanup) = self.store.delete_payment_record(&claim.dedupe_key).await {
                    error!(order_number = order.order_number(), error = %cleanup, "failed to release refund claim");
                }
                return Err(e.into());
            }
        };
        let order = self.transition(order, |o| o.refund(receipt.refund_ref.clone())).await.map_err(|e| {
            error!(order_number = %claim.tran_id, refund_ref = %receipt.refund_ref, error = %e, "refund issued but order not updated");
            e
        })?;
        info!(order_number = order.order_number(), refund_ref = %receipt.refund_ref, "order refunded");
        Ok(order)
    }

    // --- payment window ---

    /// Cancels unpaid orders older than the payment window. Returns how many were cancelled.
    #[instrument(skip(self))]
    pub async fn expire_unpaid(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self.store.orders_awaiting_payment_before(now - self.payment_window).await?;
        let mut expired = 0;
        for order in stale {
            let order_number = order.order_number().to_string();
            let result = self
                .transition(order, |o| {
                    if !o.status().awaits_payment() {
                        return Err(OrderError::InvalidTransition { from: o.status(), to: OrderStatus::Cancelled });
                    }
                    o.cancel("Payment window expired")
                })
                .await;
            match result {
                Ok(_) => expired += 1,
                // Paid in the meantime.
                Err(StorefrontError::Order(OrderError::InvalidTransition { .. })) => {}
                Err(e) => warn!(%order_number, error = %e, "failed to expire order"),
            }
        }
        if expired > 0 {
            info!(expired, "expired unpaid orders");
        }
        Ok(expired)
    }

    pub fn spawn_expiry_sweeper(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = self.expire_unpaid(Utc::now()).await {
                    error!(error = %e, "payment window sweep failed");
                }
            }
        })
    }
}

fn refund_claim(order: &Order, val_id: &str, remarks: &str) -> PaymentRecord {
    PaymentRecord {
        id: Uuid::now_v7(),
        order_id: Some(order.id()),
        dedupe_key: format!("refund:{}", order.id()),
        tran_id: order.order_number().to_string(),
        val_id: Some(val_id.to_string()),
        gateway_status: "REFUND_REQUESTED".into(),
        disposition: PaymentDisposition::Refund,
        amount: Some(order.totals().total),
        currency: Some(order.totals().currency.clone()),
        payload: serde_json::json!({ "remarks": remarks }),
        received_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{ContactInfo, OrderLine, PaymentStatus, Product, ShippingAddress};
    use crate::domain::pricing::PricingPolicy;
    use crate::domain::value_objects::Sku;
    use crate::payment::fake::FakeGateway;
    use crate::payment::{IpnPayload, PaymentError, RefundReceipt, ValidatedPayment};
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: Arc<FakeGateway>,
        orders: OrderService,
        product: Product,
        customer_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let orders = OrderService::new(
            store.clone(),
            gateway.clone(),
            EventPublisher::disabled(),
            SessionUrls::for_site("http://shop.test"),
            chrono::Duration::minutes(30),
        );
        let mut product = Product::create(Sku::generate(), "Panjabi", Decimal::new(2200, 0)).unwrap();
        product.stock = 4;
        product.publish().unwrap();
        store.insert_product(&product).await.unwrap();
        Fixture { store, gateway, orders, product, customer_id: Uuid::now_v7() }
    }

    impl Fixture {
        async fn place(&self, quantity: u32) -> Order {
            let line = OrderLine::new(self.product.id, None, self.product.name.clone(), None, self.product.sku.to_string(), quantity, self.product.price);
            let totals = PricingPolicy::default().totals([(line.unit_price, line.quantity)]);
            let order = Order::place(self.customer_id, ContactInfo::default(), ShippingAddress::default(), vec![line], totals, None).unwrap();
            self.store.place_order(&order, Uuid::nil()).await.unwrap();
            self.store.order(order.id()).await.unwrap().unwrap()
        }

        async fn pay(&self, order: &Order) -> Order {
            let mut paid = order.clone();
            paid.mark_paid(CapturedPayment {
                val_id: "VAL-1".into(),
                bank_tran_id: Some("BANK-1".into()),
                amount: order.totals().total,
                currency: "BDT".into(),
            })
            .unwrap();
            self.store.commit_order(&paid, order.version(), OrderCommit::default()).await.unwrap();
            self.store.order(order.id()).await.unwrap().unwrap()
        }

        async fn stock(&self) -> u32 { self.store.product(self.product.id).await.unwrap().unwrap().stock }
    }

    #[tokio::test]
    async fn payment_initiation_stores_session() {
        let f = fixture().await;
        let order = f.place(1).await;
        let redirect = f.orders.initiate_payment(f.customer_id, order.id()).await.unwrap();
        assert_eq!(redirect.session.session_key, "SESSION-1");
        let stored = f.store.order(order.id()).await.unwrap().unwrap();
        assert_eq!(stored.gateway_session_key(), Some("SESSION-1"));
        assert_eq!(stored.version(), 1);

        let stranger = Uuid::now_v7();
        assert!(matches!(f.orders.initiate_payment(stranger, order.id()).await, Err(StorefrontError::NotFound(_))));
    }

    #[tokio::test]
    async fn paid_orders_cannot_be_charged_again() {
        let f = fixture().await;
        let order = f.place(1).await;
        f.pay(&order).await;
        let err = f.orders.initiate_payment(f.customer_id, order.id()).await.unwrap_err();
        assert!(matches!(err, StorefrontError::Order(OrderError::AlreadyPaid)));
        assert!(f.gateway.sessions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn customer_cancel_releases_stock() {
        let f = fixture().await;
        let order = f.place(2).await;
        assert_eq!(f.stock().await, 2);
        let cancelled = f.orders.cancel_by_customer(f.customer_id, order.id()).await.unwrap();
        assert_eq!(cancelled.status(), OrderStatus::Cancelled);
        assert_eq!(f.stock().await, 4);
        assert!(f.orders.cancel_by_customer(f.customer_id, order.id()).await.is_err());
        assert_eq!(f.stock().await, 4);
    }

    #[tokio::test]
    async fn fulfilment_flow() {
        let f = fixture().await;
        let order = f.place(1).await;
        assert!(f.orders.ship(order.id(), None).await.is_err());
        f.pay(&order).await;
        let shipped = f.orders.ship(order.id(), Some("TRK-9".into())).await.unwrap();
        assert_eq!(shipped.tracking_number(), Some("TRK-9"));
        let delivered = f.orders.deliver(order.id()).await.unwrap();
        assert_eq!(delivered.status(), OrderStatus::Delivered);
    }

    #[tokio::test]
    async fn refund_before_shipping_restocks() {
        let f = fixture().await;
        let order = f.place(1).await;
        f.pay(&order).await;
        let refunded = f.orders.refund(order.id(), "customer request").await.unwrap();
        assert_eq!(refunded.payment_status(), PaymentStatus::Refunded);
        assert_eq!(refunded.refund_ref(), Some("REF-BANK-1"));
        assert_eq!(f.gateway.refunds.lock().unwrap().as_slice(), &[("BANK-1".to_string(), order.totals().total)]);
        assert_eq!(f.stock().await, 4);
    }

    #[tokio::test]
    async fn refund_after_shipping_keeps_stock() {
        let f = fixture().await;
        let order = f.place(1).await;
        f.pay(&order).await;
        f.orders.ship(order.id(), None).await.unwrap();
        f.orders.refund(order.id(), "damaged").await.unwrap();
        assert_eq!(f.stock().await, 3);
    }

    #[tokio::test]
    async fn unpaid_orders_refuse_refunds() {
        let f = fixture().await;
        let order = f.place(1).await;
        assert!(matches!(f.orders.refund(order.id(), "x").await, Err(StorefrontError::Order(_))));
        assert!(f.gateway.refunds.lock().unwrap().is_empty());
    }

    /// Yields inside `refund` so a competing call can run, and can fail the first refund.
    struct SlowRefunds {
        inner: Arc<FakeGateway>,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl PaymentGateway for SlowRefunds {
        async fn create_session(&self, order: &Order, urls: &SessionUrls) -> std::result::Result<GatewaySession, PaymentError> {
            self.inner.create_session(order, urls).await
        }

        async fn validate(&self, val_id: &str) -> std::result::Result<ValidatedPayment, PaymentError> { self.inner.validate(val_id).await }

        async fn refund(&self, bank_tran_id: &str, amount: Decimal, remarks: &str) -> std::result::Result<RefundReceipt, PaymentError> {
            tokio::task::yield_now().await;
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(PaymentError::Declined("REFUND_FAILED".into()));
            }
            self.inner.refund(bank_tran_id, amount, remarks).await
        }

        fn verify_notification(&self, payload: &IpnPayload) -> bool { self.inner.verify_notification(payload) }
    }

    fn with_slow_refunds(f: &Fixture, fail_first: bool) -> OrderService {
        let gateway = SlowRefunds { inner: f.gateway.clone(), fail_next: std::sync::atomic::AtomicBool::new(fail_first) };
        OrderService::new(
            f.store.clone(),
            Arc::new(gateway),
            EventPublisher::disabled(),
            SessionUrls::for_site("http://shop.test"),
            chrono::Duration::minutes(30),
        )
    }

    #[tokio::test]
    async fn concurrent_refunds_pay_out_once() {
        let f = fixture().await;
        let order = f.place(1).await;
        f.pay(&order).await;
        let orders = with_slow_refunds(&f, false);

        let (first, second) = tokio::join!(orders.refund(order.id(), "first"), orders.refund(order.id(), "second"));
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let loser = first.err().or(second.err()).unwrap();
        assert!(matches!(loser, StorefrontError::Conflict(_) | StorefrontError::Order(_)), "{loser}");

        assert_eq!(f.gateway.refunds.lock().unwrap().len(), 1);
        assert_eq!(f.store.order(order.id()).await.unwrap().unwrap().status(), OrderStatus::Refunded);
        let ledger = f.store.payment_records(order.id()).await.unwrap();
        assert_eq!(ledger.iter().filter(|r| r.disposition == PaymentDisposition::Refund).count(), 1);
    }

    #[tokio::test]
    async fn failed_gateway_refund_can_be_retried() {
        let f = fixture().await;
        let order = f.place(1).await;
        f.pay(&order).await;
        let orders = with_slow_refunds(&f, true);

        assert!(matches!(orders.refund(order.id(), "x").await, Err(StorefrontError::Payment(_))));
        assert_eq!(f.store.order(order.id()).await.unwrap().unwrap().status(), OrderStatus::Paid);
        assert!(f.store.payment_records(order.id()).await.unwrap().is_empty());

        let refunded = orders.refund(order.id(), "x").await.unwrap();
        assert_eq!(refunded.status(), OrderStatus::Refunded);
        assert_eq!(f.gateway.refunds.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweeper_expires_only_stale_unpaid_orders() {
        let f = fixture().await;
        let stale = f.place(1).await;
        let paid = f.place(1).await;
        f.pay(&paid).await;
        assert_eq!(f.stock().await, 2);

        assert_eq!(f.orders.expire_unpaid(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::minutes(31);
        assert_eq!(f.orders.expire_unpaid(later).await.unwrap(), 1);
        assert_eq!(f.store.order(stale.id()).await.unwrap().unwrap().status(), OrderStatus::Cancelled);
        assert_eq!(f.store.order(paid.id()).await.unwrap().unwrap().status(), OrderStatus::Paid);
        assert_eq!(f.stock().await, 3);

        let err = f.orders.initiate_payment(f.customer_id, stale.id()).await.unwrap_err();
        assert!(matches!(err, StorefrontError::Order(OrderError::InvalidTransition { .. })));
    }
}
