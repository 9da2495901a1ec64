//! Carts and the cart → order conversion.
//!
//! Cart prices are indicative. Checkout re-prices every line against the live
//! catalog, snapshots the result into an [`Order`] and hands it to
//! [`StorefrontStore::place_order`], which reserves stock, honours the
//! idempotency key and drops the cart in one atomic step.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{normalize_phone, validate_phone, validate_zip};
use crate::domain::aggregates::{Cart, CartError, CartItem, CartOwner, ContactInfo, Customer, Order, OrderLine, ShippingAddress};
use crate::domain::pricing::{OrderTotals, PricingPolicy};
use crate::domain::value_objects::{Money, ZipCode};
use crate::publisher::EventPublisher;
use crate::store::{PlaceOrderOutcome, StorefrontStore};
use crate::{Result, StorefrontError};

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct ShippingInput {
    #[validate(length(min = 1, max = 100))]
    pub recipient_name: String,
    #[validate(length(min = 1), custom = "validate_phone")]
    pub phone_number: String,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    pub state: Option<String>,
    #[serde(default = "default_country")]
    pub country: String,
    #[validate(custom = "validate_zip")]
    pub zip_code: String,
    pub delivery_instructions: Option<String>,
}

fn default_country() -> String { "Bangladesh".to_string() }

impl ShippingInput {
    fn into_address(self) -> Result<ShippingAddress> {
        Ok(ShippingAddress {
            recipient_name: self.recipient_name.trim().to_string(),
            phone_number: normalize_phone(Some(&self.phone_number))?
                .ok_or_else(|| StorefrontError::Validation("A phone number is required.".into()))?,
            line1: self.line1.trim().to_string(),
            line2: self.line2,
            city: self.city.trim().to_string(),
            state: self.state,
            zip_code: ZipCode::parse(&self.zip_code)?.as_str().to_string(),
            country: self.country.trim().to_string(),
            delivery_instructions: self.delivery_instructions,
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize, Validate)]
pub struct CheckoutInput {
    /// A saved address; takes precedence over `shipping_address`.
    pub address_id: Option<Uuid>,
    #[validate]
    pub shipping_address: Option<ShippingInput>,
    #[validate(length(max = 150))]
    pub contact_name: Option<String>,
    #[validate(email)]
    pub contact_email: Option<String>,
    #[validate(custom = "validate_phone")]
    pub contact_phone: Option<String>,
    /// Total the shopper was shown; checkout fails if prices moved since.
    pub expected_total: Option<Decimal>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CartView {
    #[serde(flatten)]
    pub cart: Cart,
    pub item_count: u32,
    pub totals: OrderTotals,
}

#[derive(Clone, Debug)]
pub struct PlacedOrder {
    pub order: Order,
    /// `false` when an earlier request with the same idempotency key produced it.
    pub created: bool,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn StorefrontStore>,
    events: EventPublisher,
    pricing: PricingPolicy,
}

impl CheckoutService {
    pub fn new(store: Arc<dyn StorefrontStore>, events: EventPublisher, pricing: PricingPolicy) -> Self {
        Self { store, events, pricing }
    }

    pub fn pricing(&self) -> &PricingPolicy { &self.pricing }

    fn view(&self, cart: Cart) -> CartView {
        let totals = self.pricing.totals(cart.priced_lines());
        CartView { item_count: cart.item_count(), totals, cart }
    }

    async fn load_or_new(&self, owner: &CartOwner) -> Result<Cart> {
        Ok(self.store.cart(owner).await?.unwrap_or_else(|| Cart::new(owner.clone(), &self.pricing.currency)))
    }

    async fn load_existing(&self, owner: &CartOwner) -> Result<Cart> {
        self.store.cart(owner).await?.ok_or(StorefrontError::Cart(CartError::ItemNotFound))
    }

    pub async fn cart(&self, owner: &CartOwner) -> Result<CartView> {
        Ok(self.view(self.load_or_new(owner).await?))
    }

    #[instrument(skip(self))]
    pub async fn add_item(&self, owner: &CartOwner, product_id: Uuid, variant_id: Option<Uuid>, quantity: u32) -> Result<CartView> {
        if quantity == 0 {
            return Err(CartError::InvalidQuantity.into());
        }
        let product = self.store.product(product_id).await?.ok_or(StorefrontError::NotFound("Product"))?;
        let selection = product.select(variant_id)?;
        let mut cart = self.load_or_new(owner).await?;
        let wanted = cart.quantity_of(product_id, variant_id).saturating_add(quantity);
        if wanted > selection.available {
            return Err(StorefrontError::OutOfStock { sku: selection.sku.to_string(), available: selection.available });
        }
        cart.add_item(CartItem {
            id: Uuid::now_v7(),
            product_id,
            variant_id,
            name: product.name.clone(),
            sku: selection.sku.to_string(),
            variant_label: selection.variant_label,
            quantity,
            unit_price: Money::new(selection.unit_price, &self.pricing.currency),
        })?;
        self.store.save_cart(&cart).await?;
        Ok(self.view(cart))
    }

    /// Zero removes the line.
    #[instrument(skip(self))]
    pub async fn update_item(&self, owner: &CartOwner, item_id: Uuid, quantity: u32) -> Result<CartView> {
        let mut cart = self.load_existing(owner).await?;
        let item = cart.item(item_id).ok_or(CartError::ItemNotFound)?.clone();
        if quantity > 0 {
            let product = self.store.product(item.product_id).await?.ok_or(StorefrontError::NotFound("Product"))?;
            let selection = product.select(item.variant_id)?;
            if quantity > selection.available {
                return Err(StorefrontError::OutOfStock { sku: selection.sku.to_string(), available: selection.available });
            }
        }
        cart.update_quantity(item_id, quantity)?;
        self.store.save_cart(&cart).await?;
        Ok(self.view(cart))
    }

    pub async fn remove_item(&self, owner: &CartOwner, item_id: Uuid) -> Result<CartView> {
        let mut cart = self.load_existing(owner).await?;
        cart.remove_item(item_id)?;
        self.store.save_cart(&cart).await?;
        Ok(self.view(cart))
    }

    pub async fn clear(&self, owner: &CartOwner) -> Result<()> {
        self.store.delete_cart(owner).await?;
        Ok(())
    }

    /// Folds the anonymous cart for `session_key` into the customer's cart.
    #[instrument(skip(self, session_key))]
    pub async fn merge_anonymous_cart(&self, session_key: &str, customer_id: Uuid) -> Result<()> {
        let session_owner = CartOwner::Session(session_key.to_string());
        let Some(anonymous) = self.store.cart(&session_owner).await? else { return Ok(()) };
        let owner = CartOwner::Customer(customer_id);
        let mut cart = self.load_or_new(&owner).await?;
        let merged_lines = anonymous.items().len();
        cart.absorb(anonymous);
        self.store.save_cart(&cart).await?;
        self.store.delete_cart(&session_owner).await?;
        info!(merged_lines, "anonymous cart merged");
        Ok(())
    }

    async fn shipping_for(&self, customer: &Customer, input: &mut CheckoutInput) -> Result<ShippingAddress> {
        if let Some(address_id) = input.address_id {
            let address = self.store.address(customer.id, address_id).await?.ok_or(StorefrontError::NotFound("Address"))?;
            return Ok(address.to_shipping());
        }
        if let Some(inline) = input.shipping_address.take() {
            return inline.into_address();
        }
        let saved = self.store.addresses(customer.id).await?;
        saved
            .iter()
            .find(|a| a.is_default)
            .map(|a| a.to_shipping())
            .ok_or_else(|| StorefrontError::Validation("A shipping address is required.".into()))
    }

    /// Re-prices the cart against the live catalog.
    async fn price_lines(&self, cart: &Cart) -> Result<Vec<OrderLine>> {
        let mut lines = Vec::with_capacity(cart.items().len());
        for item in cart.items() {
            let Some(product) = self.store.product(item.product_id).await? else {
                return Err(StorefrontError::Conflict(format!("{} is no longer available", item.name)));
            };
            let selection = product.select(item.variant_id)?;
            if item.quantity > selection.available {
                return Err(StorefrontError::OutOfStock { sku: selection.sku.to_string(), available: selection.available });
            }
            lines.push(OrderLine::new(
                product.id,
                item.variant_id,
                product.name.clone(),
                selection.variant_label,
                selection.sku.to_string(),
                item.quantity,
                selection.unit_price,
            ));
        }
        Ok(lines)
    }

    #[instrument(skip(self, customer, input), fields(customer_id = %customer.id))]
    pub async fn place_order(&self, customer: &Customer, mut input: CheckoutInput, idempotency_key: Option<String>) -> Result<PlacedOrder> {
        let idempotency_key = idempotency_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
        if let Some(key) = &idempotency_key {
            if let Some(order) = self.store.order_by_idempotency_key(customer.id, key).await? {
                return Ok(PlacedOrder { order, created: false });
            }
        }

        let cart = self.store.cart(&CartOwner::Customer(customer.id)).await?.filter(|c| !c.is_empty()).ok_or(StorefrontError::EmptyCart)?;
        let lines = self.price_lines(&cart).await?;
        let totals = self.pricing.totals(lines.iter().map(|l| (l.unit_price, l.quantity)));
        if let Some(expected) = input.expected_total {
            if expected != totals.total {
                return Err(StorefrontError::PriceChanged { expected, actual: totals.total });
            }
        }

        let shipping = self.shipping_for(customer, &mut input).await?;
        let contact = ContactInfo {
            name: input.contact_name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| customer.display_name().to_string()),
            email: input.contact_email.unwrap_or_else(|| customer.email.clone()),
            phone: match normalize_phone(input.contact_phone.as_deref())? {
                Some(phone) => phone,
                None => customer.phone_number.clone().unwrap_or_else(|| shipping.phone_number.clone()),
            },
        };

        let mut order = Order::place(customer.id, contact, shipping, lines, totals, idempotency_key)?;
        match self.store.place_order(&order, cart.id()).await? {
            PlaceOrderOutcome::Placed => {
                info!(order_id = %order.id(), order_number = order.order_number(), total = %order.totals().total, "order placed");
                self.events.publish_all(order.take_events()).await;
                Ok(PlacedOrder { order, created: true })
            }
            PlaceOrderOutcome::Existing(existing) => {
                warn!(order_number = existing.order_number(), "idempotency key reused");
                Ok(PlacedOrder { order: existing, created: false })
            }
        }
    }
}
