//! Cart Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::value_objects::Money;

/// Who a cart belongs to: an anonymous browser session or a signed-in customer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CartOwner {
    Session(String),
    Customer(Uuid),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cart {
    id: Uuid,
    owner: CartOwner,
    items: Vec<CartItem>,
    currency: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub sku: String,
    pub variant_label: Option<String>,
    pub quantity: u32,
    pub unit_price: Money,
}

impl CartItem {
    pub fn line_total(&self) -> Money { self.unit_price.multiply(self.quantity) }

    fn same_line(&self, product_id: Uuid, variant_id: Option<Uuid>) -> bool {
        self.product_id == product_id && self.variant_id == variant_id
    }
}

impl Cart {
    pub fn new(owner: CartOwner, currency: &str) -> Self {
        let now = Utc::now();
        Self { id: Uuid::now_v7(), owner, items: vec![], currency: currency.to_string(), created_at: now, updated_at: now }
    }

    pub(crate) fn restore(id: Uuid, owner: CartOwner, items: Vec<CartItem>, currency: String, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        Self { id, owner, items, currency, created_at, updated_at }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn owner(&self) -> &CartOwner { &self.owner }
    pub fn items(&self) -> &[CartItem] { &self.items }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Number of units across all lines.
    pub fn item_count(&self) -> u32 { self.items.iter().map(|i| i.quantity).sum() }

    pub fn subtotal(&self) -> Money {
        self.items.iter().fold(Money::zero(&self.currency), |acc, i| acc.add(&i.line_total()).unwrap_or(acc))
    }

    /// Units already in the cart for one product/variant.
    pub fn quantity_of(&self, product_id: Uuid, variant_id: Option<Uuid>) -> u32 {
        self.items.iter().filter(|i| i.same_line(product_id, variant_id)).map(|i| i.quantity).sum()
    }

    /// Adds a line, merging into an existing line for the same product and variant.
    pub fn add_item(&mut self, item: CartItem) -> Result<&CartItem, CartError> {
        if item.quantity == 0 { return Err(CartError::InvalidQuantity); }
        if item.unit_price.currency() != self.currency { return Err(CartError::CurrencyMismatch); }
        let index = match self.items.iter().position(|i| i.same_line(item.product_id, item.variant_id)) {
            Some(index) => {
                let existing = &mut self.items[index];
                existing.quantity = existing.quantity.saturating_add(item.quantity);
                existing.unit_price = item.unit_price;
                index
            }
            None => {
                self.items.push(item);
                self.items.len() - 1
            }
        };
        self.touch();
        Ok(&self.items[index])
    }

    /// Sets a line's quantity. Zero removes the line.
    pub fn update_quantity(&mut self, item_id: Uuid, quantity: u32) -> Result<(), CartError> {
        let item = self.items.iter_mut().find(|i| i.id == item_id).ok_or(CartError::ItemNotFound)?;
        if quantity == 0 {
            self.items.retain(|i| i.id != item_id);
        } else {
            item.quantity = quantity;
        }
        self.touch();
        Ok(())
    }

    pub fn item(&self, item_id: Uuid) -> Option<&CartItem> { self.items.iter().find(|i| i.id == item_id) }

    pub fn remove_item(&mut self, item_id: Uuid) -> Result<(), CartError> {
        let before = self.items.len();
        self.items.retain(|i| i.id != item_id);
        if self.items.len() == before { return Err(CartError::ItemNotFound); }
        self.touch();
        Ok(())
    }

    pub fn clear(&mut self) { self.items.clear(); self.touch(); }

    /// Folds another cart (typically an anonymous one) into this one.
    pub fn absorb(&mut self, other: Cart) {
        for mut item in other.items {
            if item.unit_price.currency() != self.currency { continue; }
            item.id = Uuid::now_v7();
            let _ = self.add_item(item);
        }
    }

    /// Lines as `(unit_price, quantity)` for pricing.
    pub fn priced_lines(&self) -> impl Iterator<Item = (Decimal, u32)> + '_ {
        self.items.iter().map(|i| (i.unit_price.amount(), i.quantity))
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartError {
    #[error("Item not found")]
    ItemNotFound,
    #[error("Quantity must be at least 1")]
    InvalidQuantity,
    #[error("Cart currency mismatch")]
    CurrencyMismatch,
    #[error("Cart is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product_id: Uuid, quantity: u32, price: i64) -> CartItem {
        CartItem {
            id: Uuid::now_v7(), product_id, variant_id: None, name: "Widget".into(), sku: "W1".into(),
            variant_label: None, quantity, unit_price: Money::new(Decimal::new(price, 0), "BDT"),
        }
    }

    #[test]
    fn test_cart_operations() {
        let product = Uuid::now_v7();
        let mut cart = Cart::new(CartOwner::Session("abc".into()), "BDT");
        cart.add_item(item(product, 2, 10)).unwrap();
        assert_eq!(cart.items().len(), 1);
        assert_eq!(cart.subtotal().amount(), Decimal::new(20, 0));
        cart.add_item(item(product, 1, 10)).unwrap();
        assert_eq!(cart.items()[0].quantity, 3); // Merged
        assert_eq!(cart.item_count(), 3);
    }

    #[test]
    fn test_zero_quantity_removes_line() {
        let mut cart = Cart::new(CartOwner::Customer(Uuid::now_v7()), "BDT");
        let id = cart.add_item(item(Uuid::now_v7(), 2, 10)).unwrap().id;
        cart.update_quantity(id, 0).unwrap();
        assert!(cart.is_empty());
        assert_eq!(cart.remove_item(id), Err(CartError::ItemNotFound));
    }

    #[test]
    fn test_rejects_zero_quantity_add() {
        let mut cart = Cart::new(CartOwner::Session("abc".into()), "BDT");
        assert_eq!(cart.add_item(item(Uuid::now_v7(), 0, 10)).unwrap_err(), CartError::InvalidQuantity);
    }

    #[test]
    fn test_absorb_merges_matching_lines() {
        let shared = Uuid::now_v7();
        let mut mine = Cart::new(CartOwner::Customer(Uuid::now_v7()), "BDT");
        mine.add_item(item(shared, 1, 10)).unwrap();
        let mut anonymous = Cart::new(CartOwner::Session("s1".into()), "BDT");
        anonymous.add_item(item(shared, 2, 10)).unwrap();
        anonymous.add_item(item(Uuid::now_v7(), 1, 5)).unwrap();
        mine.absorb(anonymous);
        assert_eq!(mine.items().len(), 2);
        assert_eq!(mine.quantity_of(shared, None), 3);
        assert_eq!(mine.subtotal().amount(), Decimal::new(35, 0));
    }
}
