//! Product Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::value_objects::{round2, Quantity, Sku, Slug};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Category {
    pub fn create(name: impl Into<String>, description: Option<String>, parent_id: Option<Uuid>) -> Result<Self, ProductError> {
        let name = name.into();
        let slug = Slug::from_name(&name).map_err(|_| ProductError::MissingName)?;
        Ok(Self { id: Uuid::now_v7(), name, slug: slug.into_inner(), description, parent_id, image_url: None, created_at: Utc::now() })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Brand {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Brand {
    pub fn create(name: impl Into<String>, description: Option<String>) -> Result<Self, ProductError> {
        let name = name.into();
        let slug = Slug::from_name(&name).map_err(|_| ProductError::MissingName)?;
        Ok(Self { id: Uuid::now_v7(), name, slug: slug.into_inner(), description, logo_url: None, created_at: Utc::now() })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus { #[default] Draft, Active, Archived }

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Draft => "draft", Self::Active => "active", Self::Archived => "archived" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s { "draft" => Some(Self::Draft), "active" => Some(Self::Active), "archived" => Some(Self::Archived), _ => None }
    }
}

/// A purchasable option of a product, e.g. Size M.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub value: String,
    pub sku: Option<Sku>,
    pub price_override: Option<Decimal>,
    pub stock: u32,
}

impl Variant {
    pub fn label(&self) -> String { format!("{}: {}", self.name, self.value) }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub sku: Sku,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub category_id: Option<Uuid>,
    pub brand_id: Option<Uuid>,
    pub price: Decimal,
    pub sale_price: Option<Decimal>,
    pub stock: u32,
    pub status: ProductStatus,
    pub is_featured: bool,
    pub is_new_arrival: bool,
    pub images: Vec<String>,
    pub tags: Vec<String>,
    pub variants: Vec<Variant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Price and availability of one product/variant selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub unit_price: Decimal,
    pub available: u32,
    pub sku: Sku,
    pub variant_label: Option<String>,
}

impl Product {
    pub fn create(sku: Sku, name: impl Into<String>, price: Decimal) -> Result<Self, ProductError> {
        let name = name.into();
        if name.trim().is_empty() { return Err(ProductError::MissingName); }
        if price.is_sign_negative() { return Err(ProductError::InvalidPrice); }
        let slug = Slug::from_name(&name).map_err(|_| ProductError::MissingName)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(), sku, name, slug: slug.into_inner(), description: String::new(),
            category_id: None, brand_id: None, price: round2(price), sale_price: None, stock: 0,
            status: ProductStatus::Draft, is_featured: false, is_new_arrival: false,
            images: vec![], tags: vec![], variants: vec![], created_at: now, updated_at: now,
        })
    }

    pub fn is_active(&self) -> bool { self.status == ProductStatus::Active }

    /// Sale price when it undercuts the list price.
    pub fn current_price(&self) -> Decimal {
        match self.sale_price {
            Some(sale) if sale < self.price => sale,
            _ => self.price,
        }
    }

    pub fn is_on_sale(&self) -> bool { self.current_price() < self.price }

    pub fn variant(&self, variant_id: Uuid) -> Option<&Variant> { self.variants.iter().find(|v| v.id == variant_id) }

    pub fn total_stock(&self) -> u32 {
        if self.variants.is_empty() { self.stock } else { self.variants.iter().map(|v| v.stock).sum() }
    }

    /// Resolves what a shopper is buying. Products with variants require one to be chosen.
    pub fn select(&self, variant_id: Option<Uuid>) -> Result<Selection, ProductError> {
        if !self.is_active() { return Err(ProductError::Unavailable); }
        match variant_id {
            Some(id) => {
                let variant = self.variant(id).ok_or(ProductError::VariantNotFound)?;
                Ok(Selection {
                    unit_price: variant.price_override.unwrap_or_else(|| self.current_price()),
                    available: variant.stock,
                    sku: variant.sku.clone().unwrap_or_else(|| self.sku.clone()),
                    variant_label: Some(variant.label()),
                })
            }
            None if !self.variants.is_empty() => Err(ProductError::VariantRequired),
            None => Ok(Selection { unit_price: self.current_price(), available: self.stock, sku: self.sku.clone(), variant_label: None }),
        }
    }

    pub fn publish(&mut self) -> Result<(), ProductError> {
        if self.name.is_empty() { return Err(ProductError::MissingName); }
        self.status = ProductStatus::Active;
        self.touch();
        Ok(())
    }

    pub fn archive(&mut self) { self.status = ProductStatus::Archived; self.touch(); }

    pub fn update_price(&mut self, price: Decimal, sale_price: Option<Decimal>) -> Result<(), ProductError> {
        if price.is_sign_negative() || sale_price.is_some_and(|s| s.is_sign_negative()) {
            return Err(ProductError::InvalidPrice);
        }
        self.price = round2(price);
        self.sale_price = sale_price.map(round2);
        self.touch();
        Ok(())
    }

    pub fn add_variant(&mut self, name: impl Into<String>, value: impl Into<String>, sku: Option<Sku>, price_override: Option<Decimal>, stock: u32) -> Result<&Variant, ProductError> {
        let (name, value) = (name.into(), value.into());
        if self.variants.iter().any(|v| v.name.eq_ignore_ascii_case(&name) && v.value.eq_ignore_ascii_case(&value)) {
            return Err(ProductError::DuplicateVariant);
        }
        if price_override.is_some_and(|p| p.is_sign_negative()) { return Err(ProductError::InvalidPrice); }
        self.variants.push(Variant { id: Uuid::now_v7(), product_id: self.id, name, value, sku, price_override: price_override.map(round2), stock });
        self.touch();
        Ok(&self.variants[self.variants.len() - 1])
    }

    pub fn add_inventory(&mut self, variant_id: Option<Uuid>, qty: u32) -> Result<(), ProductError> {
        let slot = self.stock_slot(variant_id)?;
        *slot = Quantity::new(*slot).add(qty).value();
        self.touch();
        Ok(())
    }

    pub fn remove_inventory(&mut self, variant_id: Option<Uuid>, qty: u32) -> Result<(), ProductError> {
        let slot = self.stock_slot(variant_id)?;
        *slot = Quantity::new(*slot).subtract(qty).ok_or(ProductError::InsufficientInventory)?.value();
        self.touch();
        Ok(())
    }

    fn stock_slot(&mut self, variant_id: Option<Uuid>) -> Result<&mut u32, ProductError> {
        match variant_id {
            Some(id) => self.variants.iter_mut().find(|v| v.id == id).map(|v| &mut v.stock).ok_or(ProductError::VariantNotFound),
            None => Ok(&mut self.stock),
        }
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProductError {
    #[error("Missing name")]
    MissingName,
    #[error("Price cannot be negative")]
    InvalidPrice,
    #[error("Product is not available for sale")]
    Unavailable,
    #[error("Variant not found")]
    VariantNotFound,
    #[error("Choose a variant of this product")]
    VariantRequired,
    #[error("Variant already exists")]
    DuplicateVariant,
    #[error("Insufficient inventory")]
    InsufficientInventory,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Product {
        let mut p = Product::create(Sku::new("TEST-001").unwrap(), "Test Product", Decimal::new(2599, 2)).unwrap();
        p.publish().unwrap();
        p
    }

    #[test]
    fn test_product_create() {
        let p = Product::create(Sku::new("TEST-001").unwrap(), "Test Product", Decimal::new(1999, 2)).unwrap();
        assert_eq!(p.name, "Test Product");
        assert_eq!(p.slug, "test-product");
        assert_eq!(p.status, ProductStatus::Draft);
    }

    #[test]
    fn test_sale_price_only_applies_when_lower() {
        let mut p = product();
        p.update_price(Decimal::new(2599, 2), Some(Decimal::new(1999, 2))).unwrap();
        assert_eq!(p.current_price(), Decimal::new(1999, 2));
        assert!(p.is_on_sale());
        p.update_price(Decimal::new(2599, 2), Some(Decimal::new(2999, 2))).unwrap();
        assert_eq!(p.current_price(), Decimal::new(2599, 2));
    }

    #[test]
    fn test_inventory() {
        let mut p = product();
        p.add_inventory(None, 10).unwrap();
        p.remove_inventory(None, 5).unwrap();
        assert_eq!(p.stock, 5);
        assert_eq!(p.remove_inventory(None, 6), Err(ProductError::InsufficientInventory));
        assert_eq!(p.stock, 5);
    }

    #[test]
    fn test_variant_selection() {
        let mut p = product();
        let id = p.add_variant("Size", "M", None, Some(Decimal::new(3000, 2)), 4).unwrap().id;
        assert_eq!(p.select(None), Err(ProductError::VariantRequired));
        let sel = p.select(Some(id)).unwrap();
        assert_eq!(sel.unit_price, Decimal::new(3000, 2));
        assert_eq!(sel.available, 4);
        assert_eq!(sel.variant_label.as_deref(), Some("Size: M"));
        assert_eq!(p.add_variant("size", "m", None, None, 1).unwrap_err(), ProductError::DuplicateVariant);
    }

    #[test]
    fn test_archived_product_cannot_be_selected() {
        let mut p = product();
        p.archive();
        assert_eq!(p.select(None), Err(ProductError::Unavailable));
    }
}
