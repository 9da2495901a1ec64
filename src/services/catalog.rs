//! Catalog browsing and administration, reviews and wishlists.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::domain::aggregates::{Brand, Category, Product, ProductStatus, RatingSummary, Review, WishlistEntry};
use crate::domain::value_objects::{Rating, Sku, Slug};
use crate::store::{Page, PageRequest, ProductQuery, StoreError, StorefrontStore};
use crate::{Result, StorefrontError};

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct NewProduct {
    /// Generated when absent.
    pub sku: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category_id: Option<Uuid>,
    pub brand_id: Option<Uuid>,
    pub price: Decimal,
    pub sale_price: Option<Decimal>,
    #[serde(default)]
    pub stock: u32,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub is_new_arrival: bool,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Publish immediately instead of saving as a draft.
    #[serde(default)]
    pub publish: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Validate)]
pub struct ProductUpdate {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub category_id: Option<Uuid>,
    pub brand_id: Option<Uuid>,
    pub price: Option<Decimal>,
    /// `Some(None)` clears the sale price.
    #[serde(default, with = "double_option")]
    pub sale_price: Option<Option<Decimal>>,
    pub is_featured: Option<bool>,
    pub is_new_arrival: Option<bool>,
    pub images: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub status: Option<ProductStatus>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct NewVariant {
    #[validate(length(min = 1, max = 50))]
    pub name: String,
    #[validate(length(min = 1, max = 50))]
    pub value: String,
    pub sku: Option<String>,
    pub price_override: Option<Decimal>,
    #[serde(default)]
    pub stock: u32,
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct NewReview {
    #[validate(range(min = 1, max = 5))]
    pub rating: u8,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 5000))]
    pub body: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProductDetail {
    #[serde(flatten)]
    pub product: Product,
    pub current_price: Decimal,
    pub is_on_sale: bool,
    pub in_stock: bool,
    pub rating: RatingSummary,
}

impl ProductDetail {
    fn new(product: Product, rating: RatingSummary) -> Self {
        Self {
            current_price: product.current_price(),
            is_on_sale: product.is_on_sale(),
            in_stock: product.total_stock() > 0,
            product,
            rating,
        }
    }
}

/// Listing entry: the product with its effective price and availability.
#[derive(Clone, Debug, Serialize)]
pub struct ProductCard {
    #[serde(flatten)]
    pub product: Product,
    pub current_price: Decimal,
    pub is_on_sale: bool,
    pub in_stock: bool,
}

impl From<Product> for ProductCard {
    fn from(product: Product) -> Self {
        Self {
            current_price: product.current_price(),
            is_on_sale: product.is_on_sale(),
            in_stock: product.total_stock() > 0,
            product,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WishlistItem {
    pub product_id: Uuid,
    pub name: String,
    pub slug: String,
    pub current_price: Decimal,
    pub image: Option<String>,
    pub in_stock: bool,
    pub added_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn StorefrontStore>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn StorefrontStore>) -> Self { Self { store } }

    async fn load(&self, id: Uuid) -> Result<Product> {
        self.store.product(id).await?.ok_or(StorefrontError::NotFound("Product"))
    }

    pub async fn list_products(&self, query: &ProductQuery) -> Result<Page<Product>> {
        Ok(self.store.list_products(query).await?)
    }

    /// Shoppers only see active products; staff see everything.
    pub async fn product_detail(&self, id: Uuid, include_inactive: bool) -> Result<ProductDetail> {
        let product = self.load(id).await?;
        if !include_inactive && !product.is_active() {
            return Err(StorefrontError::NotFound("Product"));
        }
        let rating = self.store.rating_summary(id).await?;
        Ok(ProductDetail::new(product, rating))
    }

    pub async fn categories(&self) -> Result<Vec<Category>> { Ok(self.store.list_categories().await?) }

    pub async fn brands(&self) -> Result<Vec<Brand>> { Ok(self.store.list_brands().await?) }

    #[instrument(skip(self, description))]
    pub async fn create_category(&self, name: &str, description: Option<String>, parent_id: Option<Uuid>) -> Result<Category> {
        let category = Category::create(name.trim(), description, parent_id)?;
        self.store.insert_category(&category).await?;
        Ok(category)
    }

    #[instrument(skip(self, description))]
    pub async fn create_brand(&self, name: &str, description: Option<String>) -> Result<Brand> {
        let brand = Brand::create(name.trim(), description)?;
        self.store.insert_brand(&brand).await?;
        Ok(brand)
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_product(&self, input: NewProduct) -> Result<Product> {
        let sku = match input.sku.as_deref() {
            Some(raw) => Sku::new(raw)?,
            None => Sku::generate(),
        };
        let mut product = Product::create(sku, input.name.trim(), input.price)?;
        product.update_price(input.price, input.sale_price)?;
        product.description = input.description;
        product.category_id = input.category_id;
        product.brand_id = input.brand_id;
        product.stock = input.stock;
        product.is_featured = input.is_featured;
        product.is_new_arrival = input.is_new_arrival;
        product.images = input.images;
        product.tags = input.tags;
        if input.publish {
            product.publish()?;
        }
        self.store.insert_product(&product).await?;
        info!(product_id = %product.id, sku = %product.sku, "product created");
        Ok(product)
    }

    /// Descriptive changes only; stock moves through [`CatalogService::restock`] and orders.
    #[instrument(skip(self, update))]
    pub async fn update_product(&self, id: Uuid, update: ProductUpdate) -> Result<Product> {
        let mut product = self.load(id).await?;
        if let Some(name) = update.name {
            product.name = name.trim().to_string();
            product.slug = Slug::from_name(&product.name)?.into_inner();
        }
        if let Some(description) = update.description {
            product.description = description;
        }
        if update.category_id.is_some() {
            product.category_id = update.category_id;
        }
        if update.brand_id.is_some() {
            product.brand_id = update.brand_id;
        }
        if update.price.is_some() || update.sale_price.is_some() {
            let price = update.price.unwrap_or(product.price);
            let sale_price = update.sale_price.unwrap_or(product.sale_price);
            product.update_price(price, sale_price)?;
        }
        if let Some(featured) = update.is_featured {
            product.is_featured = featured;
        }
        if let Some(new_arrival) = update.is_new_arrival {
            product.is_new_arrival = new_arrival;
        }
        if let Some(images) = update.images {
            product.images = images;
        }
        if let Some(tags) = update.tags {
            product.tags = tags;
        }
        match update.status {
            Some(ProductStatus::Active) => product.publish()?,
            Some(ProductStatus::Archived) => product.archive(),
            Some(ProductStatus::Draft) => product.status = ProductStatus::Draft,
            None => {}
        }
        product.updated_at = Utc::now();
        self.store.update_product(&product).await?;
        self.load(id).await
    }

    pub async fn archive_product(&self, id: Uuid) -> Result<Product> {
        let mut product = self.load(id).await?;
        product.archive();
        self.store.update_product(&product).await?;
        info!(product_id = %id, "product archived");
        Ok(product)
    }

    #[instrument(skip(self, input))]
    pub async fn add_variant(&self, product_id: Uuid, input: NewVariant) -> Result<Product> {
        let mut product = self.load(product_id).await?;
        let sku = input.sku.as_deref().map(|s| Sku::new(s)).transpose()?;
        product.add_variant(input.name.trim(), input.value.trim(), sku, input.price_override, input.stock)?;
        self.store.update_product(&product).await?;
        self.load(product_id).await
    }

    #[instrument(skip(self))]
    pub async fn restock(&self, product_id: Uuid, variant_id: Option<Uuid>, quantity: u32) -> Result<Product> {
        if quantity == 0 {
            return Err(StorefrontError::Validation("Quantity must be at least 1.".into()));
        }
        self.store.add_stock(product_id, variant_id, quantity).await.map_err(|e| match e {
            StoreError::NotFound => StorefrontError::NotFound("Product or variant"),
            other => other.into(),
        })?;
        info!(quantity, "stock added");
        self.load(product_id).await
    }

    // --- reviews ---

    #[instrument(skip(self, input))]
    pub async fn write_review(&self, customer_id: Uuid, product_id: Uuid, input: NewReview) -> Result<Review> {
        self.load(product_id).await?;
        let rating = Rating::new(input.rating)?;
        let verified = self.store.has_purchased(customer_id, product_id).await?;
        let review = Review::write(product_id, customer_id, rating, input.title, input.body, verified);
        self.store.insert_review(&review).await.map_err(|e| match e {
            StoreError::Duplicate(_) => StorefrontError::Conflict("You have already reviewed this product.".into()),
            other => other.into(),
        })?;
        Ok(review)
    }

    pub async fn reviews(&self, product_id: Uuid, page: PageRequest) -> Result<Page<Review>> {
        Ok(self.store.reviews_for_product(product_id, page).await?)
    }

    pub async fn delete_review(&self, customer_id: Uuid, review_id: Uuid) -> Result<()> {
        let review = self.store.review(review_id).await?.ok_or(StorefrontError::NotFound("Review"))?;
        if review.customer_id != customer_id {
            return Err(StorefrontError::Forbidden("You can only delete your own reviews."));
        }
        self.store.delete_review(review_id).await?;
        Ok(())
    }

    // --- wishlist ---

    /// Returns whether the product was newly added.
    pub async fn add_to_wishlist(&self, customer_id: Uuid, product_id: Uuid) -> Result<bool> {
        self.load(product_id).await?;
        Ok(self.store.add_to_wishlist(&WishlistEntry { customer_id, product_id, added_at: Utc::now() }).await?)
    }

    pub async fn remove_from_wishlist(&self, customer_id: Uuid, product_id: Uuid) -> Result<()> {
        if !self.store.remove_from_wishlist(customer_id, product_id).await? {
            return Err(StorefrontError::NotFound("Wishlist item"));
        }
        Ok(())
    }

    pub async fn wishlist(&self, customer_id: Uuid) -> Result<Vec<WishlistItem>> {
        Ok(self
            .store
            .wishlist(customer_id)
            .await?
            .into_iter()
            .map(|(entry, product)| WishlistItem {
                product_id: product.id,
                current_price: product.current_price(),
                image: product.images.first().cloned(),
                in_stock: product.is_active() && product.total_stock() > 0,
                name: product.name,
                slug: product.slug,
                added_at: entry.added_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{ContactInfo, Order, OrderLine, ShippingAddress};
    use crate::domain::pricing::PricingPolicy;
    use crate::store::{MemoryStore, OrderCommit};

    fn service() -> (Arc<MemoryStore>, CatalogService) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), CatalogService::new(store))
    }

    fn kurta(publish: bool) -> NewProduct {
        NewProduct {
            sku: Some("kurta-001".into()),
            name: "Cotton Kurta".into(),
            description: "Hand-loomed".into(),
            category_id: None,
            brand_id: None,
            price: Decimal::new(1800, 0),
            sale_price: Some(Decimal::new(1500, 0)),
            stock: 3,
            is_featured: true,
            is_new_arrival: false,
            images: vec!["kurta.jpg".into()],
            tags: vec![],
            publish,
        }
    }

    fn review(rating: u8) -> NewReview {
        NewReview { rating, title: "Lovely".into(), body: "Fits well".into() }
    }

    #[tokio::test]
    async fn drafts_are_hidden_from_shoppers() {
        let (_, catalog) = service();
        let draft = catalog.create_product(kurta(false)).await.unwrap();
        assert!(matches!(catalog.product_detail(draft.id, false).await, Err(StorefrontError::NotFound(_))));
        assert!(catalog.product_detail(draft.id, true).await.is_ok());

        let update = ProductUpdate { status: Some(ProductStatus::Active), ..Default::default() };
        catalog.update_product(draft.id, update).await.unwrap();
        let detail = catalog.product_detail(draft.id, false).await.unwrap();
        assert_eq!(detail.product.sku.as_str(), "KURTA-001");
        assert_eq!(detail.current_price, Decimal::new(1500, 0));
        assert!(detail.is_on_sale);
    }

    #[tokio::test]
    async fn update_can_clear_sale_price() {
        let (_, catalog) = service();
        let product = catalog.create_product(kurta(true)).await.unwrap();
        let update = ProductUpdate { sale_price: Some(None), ..Default::default() };
        let updated = catalog.update_product(product.id, update).await.unwrap();
        assert_eq!(updated.sale_price, None);
        assert_eq!(updated.current_price(), Decimal::new(1800, 0));
    }

    #[tokio::test]
    async fn variants_and_restock() {
        let (_, catalog) = service();
        let product = catalog.create_product(kurta(true)).await.unwrap();
        let input = NewVariant { name: "Size".into(), value: "M".into(), sku: None, price_override: None, stock: 2 };
        let with_variant = catalog.add_variant(product.id, input.clone()).await.unwrap();
        let variant_id = with_variant.variants[0].id;
        assert!(matches!(catalog.add_variant(product.id, input).await, Err(StorefrontError::Product(_))));

        let restocked = catalog.restock(product.id, Some(variant_id), 5).await.unwrap();
        assert_eq!(restocked.variants[0].stock, 7);
        assert!(matches!(catalog.restock(product.id, Some(Uuid::now_v7()), 1).await, Err(StorefrontError::NotFound(_))));
    }

    #[tokio::test]
    async fn one_review_per_customer_with_purchase_flag() {
        let (store, catalog) = service();
        let product = catalog.create_product(kurta(true)).await.unwrap();
        let buyer = Uuid::now_v7();

        let line = OrderLine::new(product.id, None, product.name.clone(), None, product.sku.to_string(), 1, product.current_price());
        let totals = PricingPolicy::default().totals([(line.unit_price, line.quantity)]);
        let mut order = Order::place(buyer, ContactInfo::default(), ShippingAddress::default(), vec![line], totals.clone(), None).unwrap();
        store.place_order(&order, Uuid::nil()).await.unwrap();
        order
            .mark_paid(crate::domain::aggregates::CapturedPayment { val_id: "V1".into(), bank_tran_id: None, amount: totals.total, currency: totals.currency })
            .unwrap();
        store.commit_order(&order, 0, OrderCommit::default()).await.unwrap();

        let verified = catalog.write_review(buyer, product.id, review(5)).await.unwrap();
        assert!(verified.verified_purchase);
        assert!(matches!(catalog.write_review(buyer, product.id, review(4)).await, Err(StorefrontError::Conflict(_))));

        let browser = Uuid::now_v7();
        assert!(!catalog.write_review(browser, product.id, review(4)).await.unwrap().verified_purchase);
        assert!(matches!(catalog.delete_review(browser, verified.id).await, Err(StorefrontError::Forbidden(_))));

        let detail = catalog.product_detail(product.id, false).await.unwrap();
        assert_eq!(detail.rating.count, 2);
        assert_eq!(detail.rating.average, Some(Decimal::new(45, 1)));
    }

    #[tokio::test]
    async fn wishlist_is_idempotent() {
        let (_, catalog) = service();
        let product = catalog.create_product(kurta(true)).await.unwrap();
        let customer = Uuid::now_v7();
        assert!(catalog.add_to_wishlist(customer, product.id).await.unwrap());
        assert!(!catalog.add_to_wishlist(customer, product.id).await.unwrap());
        let items = catalog.wishlist(customer).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].image.as_deref(), Some("kurta.jpg"));

        catalog.remove_from_wishlist(customer, product.id).await.unwrap();
        assert!(matches!(catalog.remove_from_wishlist(customer, product.id).await, Err(StorefrontError::NotFound(_))));
        assert!(matches!(catalog.add_to_wishlist(customer, Uuid::now_v7()).await, Err(StorefrontError::NotFound(_))));
    }
}
