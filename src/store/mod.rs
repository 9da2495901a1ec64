//! Persistence boundary.
//!
//! Every method that must hold an invariant across several rows (placing an
//! order, committing an order transition, moving the default address) is a
//! single call here, so each backend can make it atomic in its own way.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{
    Address, Brand, Cart, CartOwner, Category, Customer, Order, OrderStatus, Product, RatingSummary, Review,
    WishlistEntry,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,
    #[error("Record was modified concurrently")]
    Conflict,
    #[error("Duplicate {0}")]
    Duplicate(&'static str),
    #[error("Insufficient stock for {sku}")]
    InsufficientStock { sku: String },
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page { items: self.items.into_iter().map(f).collect(), total: self.total }
    }
}

/// 1-based page window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self { page: page.unwrap_or(1).max(1), per_page: per_page.unwrap_or(20).clamp(1, 100) }
    }

    pub fn offset(&self) -> usize {
        let offset = (u64::from(self.page) - 1) * u64::from(self.per_page);
        usize::try_from(offset).unwrap_or(usize::MAX)
    }
    pub fn limit(&self) -> usize { self.per_page as usize }
}

impl Default for PageRequest {
    fn default() -> Self { Self::new(None, None) }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductSort { #[default] Newest, PriceAsc, PriceDesc, Name }

#[derive(Clone, Debug, Default)]
pub struct ProductQuery {
    pub category: Option<String>,
    pub brand: Option<String>,
    pub search: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub featured: Option<bool>,
    pub new_arrival: Option<bool>,
    pub on_sale: Option<bool>,
    pub sort: ProductSort,
    /// Staff listings also see drafts and archived products.
    pub include_inactive: bool,
    pub page: PageRequest,
}

#[derive(Clone, Debug, Default)]
pub struct OrderQuery {
    pub customer_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub page: PageRequest,
}

#[derive(Clone, Debug, Default)]
pub struct CustomerQuery {
    pub search: Option<String>,
    pub page: PageRequest,
}

/// Moderation flags staff can flip in bulk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerFlag { Verified, Active }

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub token_hash: String,
    pub customer_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenPurpose { PasswordReset, EmailVerification }

impl TokenPurpose {
    pub fn as_str(self) -> &'static str {
        match self { Self::PasswordReset => "password_reset", Self::EmailVerification => "email_verification" }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountToken {
    pub token_hash: String,
    pub customer_id: Uuid,
    pub purpose: TokenPurpose,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum PlaceOrderOutcome {
    Placed,
    /// The idempotency key was already used; this is the order it produced.
    Existing(Order),
}

/// What happened to a gateway notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentDisposition { Applied, Failed, Rejected, DuplicateCharge, LatePayment, Refund }

impl PaymentDisposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::DuplicateCharge => "duplicate_charge",
            Self::LatePayment => "late_payment",
            Self::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(Self::Applied),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            "duplicate_charge" => Some(Self::DuplicateCharge),
            "late_payment" => Some(Self::LatePayment),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

/// Ledger row for one processed gateway notification or refund. `dedupe_key` is unique.
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub dedupe_key: String,
    pub tran_id: String,
    pub val_id: Option<String>,
    pub gateway_status: String,
    pub disposition: PaymentDisposition,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Extra writes that must land atomically with an order transition.
#[derive(Clone, Debug, Default)]
pub struct OrderCommit {
    pub release_stock: bool,
    pub payment_record: Option<PaymentRecord>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CustomerStats {
    pub total_orders: i64,
    pub total_reviews: i64,
    pub total_wishlist_items: i64,
}

#[async_trait]
pub trait StorefrontStore: Send + Sync {
    // --- catalog ---
    async fn insert_category(&self, category: &Category) -> StoreResult<()>;
    async fn list_categories(&self) -> StoreResult<Vec<Category>>;
    async fn insert_brand(&self, brand: &Brand) -> StoreResult<()>;
    async fn list_brands(&self) -> StoreResult<Vec<Brand>>;
    async fn insert_product(&self, product: &Product) -> StoreResult<()>;
    /// Saves descriptive fields and inserts new variants. Stock counts are never overwritten.
    async fn update_product(&self, product: &Product) -> StoreResult<()>;
    async fn product(&self, id: Uuid) -> StoreResult<Option<Product>>;
    async fn product_by_sku(&self, sku: &str) -> StoreResult<Option<Product>>;
    async fn list_products(&self, query: &ProductQuery) -> StoreResult<Page<Product>>;
    async fn add_stock(&self, product_id: Uuid, variant_id: Option<Uuid>, quantity: u32) -> StoreResult<()>;

    // --- customers ---
    async fn insert_customer(&self, customer: &Customer) -> StoreResult<()>;
    async fn update_customer(&self, customer: &Customer) -> StoreResult<()>;
    async fn customer(&self, id: Uuid) -> StoreResult<Option<Customer>>;
    /// Case-insensitive match on username or email.
    async fn customer_by_login(&self, login: &str) -> StoreResult<Option<Customer>>;
    async fn list_customers(&self, query: &CustomerQuery) -> StoreResult<Page<Customer>>;
    async fn set_customer_flag(&self, ids: &[Uuid], flag: CustomerFlag, value: bool) -> StoreResult<u64>;
    /// Removes the account. Orders survive with their customer reference cleared.
    async fn delete_customer(&self, id: Uuid) -> StoreResult<()>;
    async fn customer_stats(&self, id: Uuid) -> StoreResult<CustomerStats>;

    // --- sessions & one-time tokens ---
    async fn insert_session(&self, session: &Session) -> StoreResult<()>;
    async fn session(&self, token_hash: &str) -> StoreResult<Option<Session>>;
    async fn delete_session(&self, token_hash: &str) -> StoreResult<()>;
    async fn delete_sessions_except(&self, customer_id: Uuid, keep: Option<&str>) -> StoreResult<()>;
    async fn insert_token(&self, token: &AccountToken) -> StoreResult<()>;
    /// Marks an unexpired token used and returns its customer. A second call returns `None`.
    async fn consume_token(&self, token_hash: &str, purpose: TokenPurpose, now: DateTime<Utc>) -> StoreResult<Option<Uuid>>;

    // --- address book ---
    async fn addresses(&self, customer_id: Uuid) -> StoreResult<Vec<Address>>;
    async fn address(&self, customer_id: Uuid, id: Uuid) -> StoreResult<Option<Address>>;
    /// Inserts and returns the stored address. The first address, or one flagged
    /// default, becomes the only default.
    async fn insert_address(&self, address: &Address) -> StoreResult<Address>;
    /// Updates fields other than the default flag.
    async fn update_address(&self, address: &Address) -> StoreResult<()>;
    /// Deletes; when the default goes, the newest remaining address takes over.
    async fn delete_address(&self, customer_id: Uuid, id: Uuid) -> StoreResult<()>;
    async fn set_default_address(&self, customer_id: Uuid, id: Uuid) -> StoreResult<()>;

    // --- carts ---
    async fn cart(&self, owner: &CartOwner) -> StoreResult<Option<Cart>>;
    async fn save_cart(&self, cart: &Cart) -> StoreResult<()>;
    async fn delete_cart(&self, owner: &CartOwner) -> StoreResult<()>;

    // --- orders ---
    /// Atomically: honour the idempotency key, reserve stock for every line,
    /// insert the order, delete the cart.
    async fn place_order(&self, order: &Order, cart_id: Uuid) -> StoreResult<PlaceOrderOutcome>;
    async fn order(&self, id: Uuid) -> StoreResult<Option<Order>>;
    async fn order_by_number(&self, order_number: &str) -> StoreResult<Option<Order>>;
    async fn order_by_idempotency_key(&self, customer_id: Uuid, key: &str) -> StoreResult<Option<Order>>;
    async fn list_orders(&self, query: &OrderQuery) -> StoreResult<Page<Order>>;
    /// Compare-and-swap on `expected_version`, plus the commit's side effects, in one unit.
    async fn commit_order(&self, order: &Order, expected_version: i64, commit: OrderCommit) -> StoreResult<()>;
    async fn orders_awaiting_payment_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Order>>;
    /// Whether the customer has a captured order containing the product.
    async fn has_purchased(&self, customer_id: Uuid, product_id: Uuid) -> StoreResult<bool>;

    // --- payment ledger ---
    async fn payment_record_exists(&self, dedupe_key: &str) -> StoreResult<bool>;
    async fn insert_payment_record(&self, record: &PaymentRecord) -> StoreResult<()>;
    async fn delete_payment_record(&self, dedupe_key: &str) -> StoreResult<()>;
    async fn payment_records(&self, order_id: Uuid) -> StoreResult<Vec<PaymentRecord>>;

    // --- reviews & wishlist ---
    async fn insert_review(&self, review: &Review) -> StoreResult<()>;
    async fn review(&self, id: Uuid) -> StoreResult<Option<Review>>;
    async fn delete_review(&self, id: Uuid) -> StoreResult<()>;
    async fn reviews_for_product(&self, product_id: Uuid, page: PageRequest) -> StoreResult<Page<Review>>;
    async fn rating_summary(&self, product_id: Uuid) -> StoreResult<RatingSummary>;
    /// Returns `false` when the product was already on the list.
    async fn add_to_wishlist(&self, entry: &WishlistEntry) -> StoreResult<bool>;
    async fn remove_from_wishlist(&self, customer_id: Uuid, product_id: Uuid) -> StoreResult<bool>;
    async fn wishlist(&self, customer_id: Uuid) -> StoreResult<Vec<(WishlistEntry, Product)>>;
}
