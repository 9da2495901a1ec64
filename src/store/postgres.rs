//! PostgreSQL store.
//!
//! Multi-row invariants run inside one transaction each. Stock is reserved
//! with conditional decrements (`... AND stock >= $n`) so concurrent
//! checkouts can never drive a count negative, and order transitions are a
//! compare-and-swap on `orders.version`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    AccountToken, CustomerFlag, CustomerQuery, CustomerStats, OrderCommit, OrderQuery, Page, PageRequest,
    PaymentDisposition, PaymentRecord, PlaceOrderOutcome, ProductQuery, ProductSort, Session, StoreError, StoreResult,
    StorefrontStore, TokenPurpose,
};
use crate::domain::aggregates::{
    Address, AddressKind, Brand, CapturedPayment, Cart, CartItem, CartOwner, Category, ContactInfo, Customer, Gender,
    Order, OrderLine, OrderStatus, PaymentStatus, Preferences, Product, ProductStatus, RatingSummary, Review,
    ShippingAddress, Variant, WishlistEntry,
};
use crate::domain::pricing::OrderTotals;
use crate::domain::value_objects::{Money, Rating, Sku};

const CURRENT_PRICE: &str = "CASE WHEN p.sale_price IS NOT NULL AND p.sale_price < p.price THEN p.sale_price ELSE p.price END";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool { &self.pool }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn duplicate_or(err: sqlx::Error, what: impl FnOnce(Option<&str>) -> &'static str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Duplicate(what(db.constraint()));
        }
    }
    StoreError::Database(err)
}

fn customer_duplicate(err: sqlx::Error) -> StoreError {
    duplicate_or(err, |constraint| match constraint {
        Some("customers_username_key") => "username",
        Some("customers_email_key") => "email",
        Some("customers_phone_key") => "phone number",
        _ => "customer",
    })
}

fn catalog_duplicate(err: sqlx::Error) -> StoreError {
    duplicate_or(err, |constraint| match constraint {
        Some("product_variants_product_id_name_value_key") => "variant",
        _ => "sku",
    })
}

fn to_i32(value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{value} out of range")))
}

fn to_u32(value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative count {value}")))
}

fn corrupt(what: &str, value: &str) -> StoreError { StoreError::Corrupt(format!("{what} {value:?}")) }

// --- rows ---

#[derive(sqlx::FromRow)]
struct CategoryRow { id: Uuid, name: String, slug: String, description: Option<String>, parent_id: Option<Uuid>, image_url: Option<String>, created_at: DateTime<Utc> }

impl From<CategoryRow> for Category {
    fn from(r: CategoryRow) -> Self {
        Category { id: r.id, name: r.name, slug: r.slug, description: r.description, parent_id: r.parent_id, image_url: r.image_url, created_at: r.created_at }
    }
}

#[derive(sqlx::FromRow)]
struct BrandRow { id: Uuid, name: String, slug: String, description: Option<String>, logo_url: Option<String>, created_at: DateTime<Utc> }

impl From<BrandRow> for Brand {
    fn from(r: BrandRow) -> Self {
        Brand { id: r.id, name: r.name, slug: r.slug, description: r.description, logo_url: r.logo_url, created_at: r.created_at }
    }
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    sku: String,
    name: String,
    slug: String,
    description: String,
    category_id: Option<Uuid>,
    brand_id: Option<Uuid>,
    price: Decimal,
    sale_price: Option<Decimal>,
    stock: i32,
    status: String,
    is_featured: bool,
    is_new_arrival: bool,
    images: Vec<String>,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct VariantRow { id: Uuid, product_id: Uuid, name: String, value: String, sku: Option<String>, price_override: Option<Decimal>, stock: i32 }

impl TryFrom<VariantRow> for Variant {
    type Error = StoreError;
    fn try_from(r: VariantRow) -> StoreResult<Self> {
        let sku = r.sku.map(|s| Sku::new(s.clone()).map_err(|_| corrupt("variant sku", &s))).transpose()?;
        Ok(Variant { id: r.id, product_id: r.product_id, name: r.name, value: r.value, sku, price_override: r.price_override, stock: to_u32(r.stock)? })
    }
}

impl ProductRow {
    fn into_product(self, variants: Vec<Variant>) -> StoreResult<Product> {
        Ok(Product {
            id: self.id,
            sku: Sku::new(self.sku.clone()).map_err(|_| corrupt("sku", &self.sku))?,
            name: self.name,
            slug: self.slug,
            description: self.description,
            category_id: self.category_id,
            brand_id: self.brand_id,
            price: self.price,
            sale_price: self.sale_price,
            stock: to_u32(self.stock)?,
            status: ProductStatus::parse(&self.status).ok_or_else(|| corrupt("product status", &self.status))?,
            is_featured: self.is_featured,
            is_new_arrival: self.is_new_arrival,
            images: self.images,
            tags: self.tags,
            variants,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    id: Uuid,
    username: String,
    email: String,
    full_name: String,
    phone_number: Option<String>,
    date_of_birth: Option<NaiveDate>,
    gender: Option<String>,
    password_hash: String,
    newsletter: bool,
    marketing_emails: bool,
    sms_notifications: bool,
    email_verified: bool,
    phone_verified: bool,
    is_verified: bool,
    is_active: bool,
    is_staff: bool,
    last_login_ip: Option<String>,
    last_login_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CustomerRow> for Customer {
    type Error = StoreError;
    fn try_from(r: CustomerRow) -> StoreResult<Self> {
        let gender = match r.gender {
            Some(g) => Some(Gender::parse(&g).ok_or_else(|| corrupt("gender", &g))?),
            None => None,
        };
        Ok(Customer {
            id: r.id,
            username: r.username,
            email: r.email,
            full_name: r.full_name,
            phone_number: r.phone_number,
            date_of_birth: r.date_of_birth,
            gender,
            password_hash: r.password_hash,
            preferences: Preferences { newsletter: r.newsletter, marketing_emails: r.marketing_emails, sms_notifications: r.sms_notifications },
            email_verified: r.email_verified,
            phone_verified: r.phone_verified,
            is_verified: r.is_verified,
            is_active: r.is_active,
            is_staff: r.is_staff,
            last_login_ip: r.last_login_ip,
            last_login_at: r.last_login_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AddressRow {
    id: Uuid,
    customer_id: Uuid,
    kind: String,
    is_default: bool,
    recipient_name: String,
    phone_number: String,
    line1: String,
    line2: Option<String>,
    city: String,
    state: Option<String>,
    country: String,
    zip_code: String,
    landmark: Option<String>,
    delivery_instructions: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AddressRow> for Address {
    type Error = StoreError;
    fn try_from(r: AddressRow) -> StoreResult<Self> {
        Ok(Address {
            id: r.id,
            customer_id: r.customer_id,
            kind: AddressKind::parse(&r.kind).ok_or_else(|| corrupt("address kind", &r.kind))?,
            is_default: r.is_default,
            recipient_name: r.recipient_name,
            phone_number: r.phone_number,
            line1: r.line1,
            line2: r.line2,
            city: r.city,
            state: r.state,
            country: r.country,
            zip_code: r.zip_code,
            landmark: r.landmark,
            delivery_instructions: r.delivery_instructions,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CartRow { id: Uuid, owner_kind: String, owner_key: String, currency: String, created_at: DateTime<Utc>, updated_at: DateTime<Utc> }

#[derive(sqlx::FromRow)]
struct CartItemRow { id: Uuid, product_id: Uuid, variant_id: Option<Uuid>, name: String, sku: String, variant_label: Option<String>, quantity: i32, unit_price: Decimal }

fn owner_columns(owner: &CartOwner) -> (&'static str, String) {
    match owner {
        CartOwner::Session(key) => ("session", key.clone()),
        CartOwner::Customer(id) => ("customer", id.to_string()),
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    customer_id: Option<Uuid>,
    contact: Json<ContactInfo>,
    shipping_address: Json<ShippingAddress>,
    status: String,
    payment_status: String,
    currency: String,
    subtotal: Decimal,
    shipping: Decimal,
    tax: Decimal,
    discount: Decimal,
    total: Decimal,
    gateway_session_key: Option<String>,
    payment: Option<Json<CapturedPayment>>,
    tracking_number: Option<String>,
    status_reason: Option<String>,
    refund_ref: Option<String>,
    idempotency_key: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    variant_id: Option<Uuid>,
    product_name: String,
    variant_label: Option<String>,
    sku: String,
    quantity: i32,
    unit_price: Decimal,
    line_total: Decimal,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderLine>) -> StoreResult<Order> {
        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            customer_id: self.customer_id,
            contact: self.contact.0,
            shipping_address: self.shipping_address.0,
            status: OrderStatus::parse(&self.status).ok_or_else(|| corrupt("order status", &self.status))?,
            payment_status: PaymentStatus::parse(&self.payment_status).ok_or_else(|| corrupt("payment status", &self.payment_status))?,
            items,
            totals: OrderTotals {
                currency: self.currency,
                subtotal: self.subtotal,
                shipping: self.shipping,
                tax: self.tax,
                discount: self.discount,
                total: self.total,
            },
            gateway_session_key: self.gateway_session_key,
            payment: self.payment.map(|p| p.0),
            tracking_number: self.tracking_number,
            status_reason: self.status_reason,
            refund_ref: self.refund_ref,
            idempotency_key: self.idempotency_key,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            paid_at: self.paid_at,
            events: vec![],
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRecordRow {
    id: Uuid,
    order_id: Option<Uuid>,
    dedupe_key: String,
    tran_id: String,
    val_id: Option<String>,
    gateway_status: String,
    disposition: String,
    amount: Option<Decimal>,
    currency: Option<String>,
    payload: serde_json::Value,
    received_at: DateTime<Utc>,
}

impl TryFrom<PaymentRecordRow> for PaymentRecord {
    type Error = StoreError;
    fn try_from(r: PaymentRecordRow) -> StoreResult<Self> {
        Ok(PaymentRecord {
            id: r.id,
            order_id: r.order_id,
            dedupe_key: r.dedupe_key,
            tran_id: r.tran_id,
            val_id: r.val_id,
            gateway_status: r.gateway_status,
            disposition: PaymentDisposition::parse(&r.disposition).ok_or_else(|| corrupt("disposition", &r.disposition))?,
            amount: r.amount,
            currency: r.currency,
            payload: r.payload,
            received_at: r.received_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReviewRow { id: Uuid, product_id: Uuid, customer_id: Uuid, rating: i16, title: String, body: String, verified_purchase: bool, created_at: DateTime<Utc> }

impl TryFrom<ReviewRow> for Review {
    type Error = StoreError;
    fn try_from(r: ReviewRow) -> StoreResult<Self> {
        let rating = u8::try_from(r.rating).ok().and_then(|v| Rating::new(v).ok()).ok_or_else(|| corrupt("rating", &r.rating.to_string()))?;
        Ok(Review { id: r.id, product_id: r.product_id, customer_id: r.customer_id, rating, title: r.title, body: r.body, verified_purchase: r.verified_purchase, created_at: r.created_at })
    }
}

// --- shared statements ---

impl PgStore {
    async fn hydrate_products(&self, rows: Vec<ProductRow>) -> StoreResult<Vec<Product>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let variant_rows = sqlx::query_as::<_, VariantRow>(
            "SELECT id, product_id, name, value, sku, price_override, stock FROM product_variants WHERE product_id = ANY($1) ORDER BY position, id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let mut by_product: HashMap<Uuid, Vec<Variant>> = HashMap::new();
        for row in variant_rows {
            by_product.entry(row.product_id).or_default().push(Variant::try_from(row)?);
        }
        rows.into_iter().map(|r| { let variants = by_product.remove(&r.id).unwrap_or_default(); r.into_product(variants) }).collect()
    }

    async fn hydrate_orders(&self, rows: Vec<OrderRow>) -> StoreResult<Vec<Order>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let item_rows = sqlx::query_as::<_, OrderItemRow>(
            "SELECT id, order_id, product_id, variant_id, product_name, variant_label, sku, quantity, unit_price, line_total \
             FROM order_items WHERE order_id = ANY($1) ORDER BY position",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let mut by_order: HashMap<Uuid, Vec<OrderLine>> = HashMap::new();
        for r in item_rows {
            by_order.entry(r.order_id).or_default().push(OrderLine {
                id: r.id,
                product_id: r.product_id,
                variant_id: r.variant_id,
                product_name: r.product_name,
                variant_label: r.variant_label,
                sku: r.sku,
                quantity: to_u32(r.quantity)?,
                unit_price: r.unit_price,
                line_total: r.line_total,
            });
        }
        rows.into_iter().map(|r| { let items = by_order.remove(&r.id).unwrap_or_default(); r.into_order(items) }).collect()
    }

    async fn hydrate_order(&self, row: Option<OrderRow>) -> StoreResult<Option<Order>> {
        match row {
            Some(row) => Ok(self.hydrate_orders(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn write_variants(tx: &mut Transaction<'_, Postgres>, product: &Product) -> StoreResult<()> {
        for (position, v) in product.variants.iter().enumerate() {
            sqlx::query(
                "INSERT INTO product_variants (id, product_id, name, value, sku, price_override, stock, position) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, value = EXCLUDED.value, sku = EXCLUDED.sku, \
                 price_override = EXCLUDED.price_override, position = EXCLUDED.position",
            )
            .bind(v.id)
            .bind(product.id)
            .bind(&v.name)
            .bind(&v.value)
            .bind(v.sku.as_ref().map(|s| s.as_str()))
            .bind(v.price_override)
            .bind(to_i32(v.stock)?)
            .bind(position as i32)
            .execute(&mut **tx)
            .await
            .map_err(catalog_duplicate)?;
        }
        Ok(())
    }

    async fn insert_order_rows(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<(), sqlx::Error> {
        let totals = order.totals();
        sqlx::query(
            "INSERT INTO orders (id, order_number, customer_id, contact, shipping_address, status, payment_status, currency, \
             subtotal, shipping, tax, discount, total, gateway_session_key, payment, tracking_number, status_reason, refund_ref, \
             idempotency_key, version, created_at, updated_at, paid_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, 0, $20, $21, $22)",
        )
        .bind(order.id())
        .bind(order.order_number())
        .bind(order.customer_id())
        .bind(Json(order.contact()))
        .bind(Json(order.shipping_address()))
        .bind(order.status().as_str())
        .bind(order.payment_status().as_str())
        .bind(&totals.currency)
        .bind(totals.subtotal)
        .bind(totals.shipping)
        .bind(totals.tax)
        .bind(totals.discount)
        .bind(totals.total)
        .bind(order.gateway_session_key())
        .bind(order.payment().map(Json))
        .bind(order.tracking_number())
        .bind(order.status_reason())
        .bind(order.refund_ref())
        .bind(order.idempotency_key())
        .bind(order.created_at())
        .bind(order.updated_at())
        .bind(order.paid_at())
        .execute(&mut **tx)
        .await?;
        for (position, line) in order.items().iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_items (id, order_id, product_id, variant_id, product_name, variant_label, sku, quantity, unit_price, line_total, position) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(line.id)
            .bind(order.id())
            .bind(line.product_id)
            .bind(line.variant_id)
            .bind(&line.product_name)
            .bind(&line.variant_label)
            .bind(&line.sku)
            .bind(line.quantity as i32)
            .bind(line.unit_price)
            .bind(line.line_total)
            .bind(position as i32)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn find_by_idempotency_key(&self, customer_id: Option<Uuid>, key: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE customer_id IS NOT DISTINCT FROM $1 AND idempotency_key = $2")
            .bind(customer_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        self.hydrate_order(row).await
    }

    async fn lock_customer(tx: &mut Transaction<'_, Postgres>, customer_id: Uuid) -> StoreResult<()> {
        sqlx::query("SELECT id FROM customers WHERE id = $1 FOR UPDATE")
            .bind(customer_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(())
    }
}

fn push_product_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &ProductQuery) {
    qb.push(" WHERE TRUE");
    if !query.include_inactive {
        qb.push(" AND p.status = 'active'");
    }
    if let Some(slug) = &query.category {
        qb.push(" AND p.category_id = (SELECT id FROM categories WHERE slug = ").push_bind(slug.clone()).push(")");
    }
    if let Some(slug) = &query.brand {
        qb.push(" AND p.brand_id = (SELECT id FROM brands WHERE slug = ").push_bind(slug.clone()).push(")");
    }
    if let Some(search) = &query.search {
        let pattern = format!("%{}%", search.replace('%', "\\%").replace('_', "\\_"));
        qb.push(" AND (p.name ILIKE ").push_bind(pattern.clone()).push(" OR p.description ILIKE ").push_bind(pattern).push(")");
    }
    if let Some(min) = query.min_price {
        qb.push(format!(" AND {CURRENT_PRICE} >= ")).push_bind(min);
    }
    if let Some(max) = query.max_price {
        qb.push(format!(" AND {CURRENT_PRICE} <= ")).push_bind(max);
    }
    if let Some(featured) = query.featured {
        qb.push(" AND p.is_featured = ").push_bind(featured);
    }
    if let Some(new_arrival) = query.new_arrival {
        qb.push(" AND p.is_new_arrival = ").push_bind(new_arrival);
    }
    if let Some(on_sale) = query.on_sale {
        qb.push(" AND (p.sale_price IS NOT NULL AND p.sale_price < p.price) = ").push_bind(on_sale);
    }
}

#[async_trait]
impl StorefrontStore for PgStore {
    async fn insert_category(&self, c: &Category) -> StoreResult<()> {
        sqlx::query("INSERT INTO categories (id, name, slug, description, parent_id, image_url, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)")
            .bind(c.id).bind(&c.name).bind(&c.slug).bind(&c.description).bind(c.parent_id).bind(&c.image_url).bind(c.created_at)
            .execute(&self.pool).await.map_err(|e| duplicate_or(e, |_| "category"))?;
        Ok(())
    }

    async fn list_categories(&self) -> StoreResult<Vec<Category>> {
        let rows = sqlx::query_as::<_, CategoryRow>("SELECT * FROM categories ORDER BY name").fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Category::from).collect())
    }

    async fn insert_brand(&self, b: &Brand) -> StoreResult<()> {
        sqlx::query("INSERT INTO brands (id, name, slug, description, logo_url, created_at) VALUES ($1, $2, $3, $4, $5, $6)")
            .bind(b.id).bind(&b.name).bind(&b.slug).bind(&b.description).bind(&b.logo_url).bind(b.created_at)
            .execute(&self.pool).await.map_err(|e| duplicate_or(e, |_| "brand"))?;
        Ok(())
    }

    async fn list_brands(&self) -> StoreResult<Vec<Brand>> {
        let rows = sqlx::query_as::<_, BrandRow>("SELECT * FROM brands ORDER BY name").fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Brand::from).collect())
    }

    async fn insert_product(&self, p: &Product) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO products (id, sku, name, slug, description, category_id, brand_id, price, sale_price, stock, status, \
             is_featured, is_new_arrival, images, tags, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(p.id).bind(p.sku.as_str()).bind(&p.name).bind(&p.slug).bind(&p.description).bind(p.category_id).bind(p.brand_id)
        .bind(p.price).bind(p.sale_price).bind(to_i32(p.stock)?).bind(p.status.as_str()).bind(p.is_featured).bind(p.is_new_arrival)
        .bind(&p.images).bind(&p.tags).bind(p.created_at).bind(p.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(catalog_duplicate)?;
        Self::write_variants(&mut tx, p).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_product(&self, p: &Product) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE products SET sku = $2, name = $3, slug = $4, description = $5, category_id = $6, brand_id = $7, price = $8, \
             sale_price = $9, status = $10, is_featured = $11, is_new_arrival = $12, images = $13, tags = $14, updated_at = $15 \
             WHERE id = $1",
        )
        .bind(p.id).bind(p.sku.as_str()).bind(&p.name).bind(&p.slug).bind(&p.description).bind(p.category_id).bind(p.brand_id)
        .bind(p.price).bind(p.sale_price).bind(p.status.as_str()).bind(p.is_featured).bind(p.is_new_arrival)
        .bind(&p.images).bind(&p.tags).bind(p.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(catalog_duplicate)?;
        if updated.rows_affected() == 0 { return Err(StoreError::NotFound); }
        Self::write_variants(&mut tx, p).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn product(&self, id: Uuid) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>("SELECT * FROM products WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(self.hydrate_products(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn product_by_sku(&self, sku: &str) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>("SELECT * FROM products WHERE UPPER(sku) = UPPER($1)")
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(self.hydrate_products(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_products(&self, query: &ProductQuery) -> StoreResult<Page<Product>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM products p");
        push_product_filters(&mut count, query);
        let (total,): (i64,) = count.build_query_as::<(i64,)>().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT p.* FROM products p");
        push_product_filters(&mut select, query);
        select.push(match query.sort {
            ProductSort::Newest => " ORDER BY p.created_at DESC, p.id DESC".to_string(),
            ProductSort::PriceAsc => format!(" ORDER BY {CURRENT_PRICE} ASC, p.id"),
            ProductSort::PriceDesc => format!(" ORDER BY {CURRENT_PRICE} DESC, p.id"),
            ProductSort::Name => " ORDER BY p.name ASC, p.id".to_string(),
        });
        select.push(" LIMIT ").push_bind(query.page.limit() as i64).push(" OFFSET ").push_bind(query.page.offset() as i64);
        let rows = select.build_query_as::<ProductRow>().fetch_all(&self.pool).await?;
        Ok(Page { items: self.hydrate_products(rows).await?, total })
    }

    async fn add_stock(&self, product_id: Uuid, variant_id: Option<Uuid>, quantity: u32) -> StoreResult<()> {
        let result = match variant_id {
            Some(variant_id) => sqlx::query("UPDATE product_variants SET stock = stock + $1 WHERE id = $2 AND product_id = $3")
                .bind(to_i32(quantity)?).bind(variant_id).bind(product_id).execute(&self.pool).await?,
            None => sqlx::query("UPDATE products SET stock = stock + $1, updated_at = NOW() WHERE id = $2")
                .bind(to_i32(quantity)?).bind(product_id).execute(&self.pool).await?,
        };
        if result.rows_affected() == 0 { return Err(StoreError::NotFound); }
        Ok(())
    }

    async fn insert_customer(&self, c: &Customer) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO customers (id, username, email, full_name, phone_number, date_of_birth, gender, password_hash, newsletter, \
             marketing_emails, sms_notifications, email_verified, phone_verified, is_verified, is_active, is_staff, last_login_ip, \
             last_login_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
        )
        .bind(c.id).bind(&c.username).bind(&c.email).bind(&c.full_name).bind(&c.phone_number).bind(c.date_of_birth)
        .bind(c.gender.map(Gender::as_str)).bind(&c.password_hash).bind(c.preferences.newsletter).bind(c.preferences.marketing_emails)
        .bind(c.preferences.sms_notifications).bind(c.email_verified).bind(c.phone_verified).bind(c.is_verified).bind(c.is_active)
        .bind(c.is_staff).bind(&c.last_login_ip).bind(c.last_login_at).bind(c.created_at).bind(c.updated_at)
        .execute(&self.pool)
        .await
        .map_err(customer_duplicate)?;
        Ok(())
    }

    async fn update_customer(&self, c: &Customer) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE customers SET username = $2, email = $3, full_name = $4, phone_number = $5, date_of_birth = $6, gender = $7, \
             password_hash = $8, newsletter = $9, marketing_emails = $10, sms_notifications = $11, email_verified = $12, \
             phone_verified = $13, is_verified = $14, is_active = $15, is_staff = $16, last_login_ip = $17, last_login_at = $18, \
             updated_at = $19 WHERE id = $1",
        )
        .bind(c.id).bind(&c.username).bind(&c.email).bind(&c.full_name).bind(&c.phone_number).bind(c.date_of_birth)
        .bind(c.gender.map(Gender::as_str)).bind(&c.password_hash).bind(c.preferences.newsletter).bind(c.preferences.marketing_emails)
        .bind(c.preferences.sms_notifications).bind(c.email_verified).bind(c.phone_verified).bind(c.is_verified).bind(c.is_active)
        .bind(c.is_staff).bind(&c.last_login_ip).bind(c.last_login_at).bind(c.updated_at)
        .execute(&self.pool)
        .await
        .map_err(customer_duplicate)?;
        if result.rows_affected() == 0 { return Err(StoreError::NotFound); }
        Ok(())
    }

    async fn customer(&self, id: Uuid) -> StoreResult<Option<Customer>> {
        sqlx::query_as::<_, CustomerRow>("SELECT * FROM customers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Customer::try_from)
            .transpose()
    }

    async fn customer_by_login(&self, login: &str) -> StoreResult<Option<Customer>> {
        sqlx::query_as::<_, CustomerRow>("SELECT * FROM customers WHERE LOWER(username) = LOWER($1) OR LOWER(email) = LOWER($1) LIMIT 1")
            .bind(login.trim())
            .fetch_optional(&self.pool)
            .await?
            .map(Customer::try_from)
            .transpose()
    }

    async fn list_customers(&self, query: &CustomerQuery) -> StoreResult<Page<Customer>> {
        let pattern = query.search.as_ref().map(|s| format!("%{}%", s.replace('%', "\\%").replace('_', "\\_")));
        let filter = "($1::text IS NULL OR username ILIKE $1 OR email ILIKE $1 OR full_name ILIKE $1 OR phone_number ILIKE $1)";
        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM customers WHERE {filter}"))
            .bind(&pattern)
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, CustomerRow>(&format!("SELECT * FROM customers WHERE {filter} ORDER BY created_at DESC LIMIT $2 OFFSET $3"))
            .bind(&pattern)
            .bind(query.page.limit() as i64)
            .bind(query.page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;
        let items = rows.into_iter().map(Customer::try_from).collect::<StoreResult<Vec<_>>>()?;
        Ok(Page { items, total })
    }

    async fn set_customer_flag(&self, ids: &[Uuid], flag: CustomerFlag, value: bool) -> StoreResult<u64> {
        let column = match flag {
            CustomerFlag::Verified => "is_verified",
            CustomerFlag::Active => "is_active",
        };
        let result = sqlx::query(&format!("UPDATE customers SET {column} = $2, updated_at = NOW() WHERE id = ANY($1)"))
            .bind(ids)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_customer(&self, id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM carts WHERE owner_kind = 'customer' AND owner_key = $1").bind(id.to_string()).execute(&mut *tx).await?;
        let result = sqlx::query("DELETE FROM customers WHERE id = $1").bind(id).execute(&mut *tx).await?;
        if result.rows_affected() == 0 { return Err(StoreError::NotFound); }
        tx.commit().await?;
        Ok(())
    }

    async fn customer_stats(&self, id: Uuid) -> StoreResult<CustomerStats> {
        let (total_orders, total_reviews, total_wishlist_items): (i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM orders WHERE customer_id = $1), \
                    (SELECT COUNT(*) FROM reviews WHERE customer_id = $1), \
                    (SELECT COUNT(*) FROM wishlist_items WHERE customer_id = $1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(CustomerStats { total_orders, total_reviews, total_wishlist_items })
    }

    async fn insert_session(&self, s: &Session) -> StoreResult<()> {
        sqlx::query("INSERT INTO sessions (token_hash, customer_id, created_at, expires_at) VALUES ($1, $2, $3, $4)")
            .bind(&s.token_hash).bind(s.customer_id).bind(s.created_at).bind(s.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn session(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        let row: Option<(String, Uuid, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as("SELECT token_hash, customer_id, created_at, expires_at FROM sessions WHERE token_hash = $1")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(token_hash, customer_id, created_at, expires_at)| Session { token_hash, customer_id, created_at, expires_at }))
    }

    async fn delete_session(&self, token_hash: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sessions WHERE token_hash = $1").bind(token_hash).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_sessions_except(&self, customer_id: Uuid, keep: Option<&str>) -> StoreResult<()> {
        sqlx::query("DELETE FROM sessions WHERE customer_id = $1 AND token_hash IS DISTINCT FROM $2")
            .bind(customer_id)
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_token(&self, t: &AccountToken) -> StoreResult<()> {
        sqlx::query("INSERT INTO account_tokens (token_hash, customer_id, purpose, expires_at) VALUES ($1, $2, $3, $4)")
            .bind(&t.token_hash).bind(t.customer_id).bind(t.purpose.as_str()).bind(t.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn consume_token(&self, token_hash: &str, purpose: TokenPurpose, now: DateTime<Utc>) -> StoreResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE account_tokens SET used_at = $3 \
             WHERE token_hash = $1 AND purpose = $2 AND used_at IS NULL AND expires_at > $3 RETURNING customer_id",
        )
        .bind(token_hash)
        .bind(purpose.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn addresses(&self, customer_id: Uuid) -> StoreResult<Vec<Address>> {
        sqlx::query_as::<_, AddressRow>("SELECT * FROM addresses WHERE customer_id = $1 ORDER BY is_default DESC, created_at DESC")
            .bind(customer_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Address::try_from)
            .collect()
    }

    async fn address(&self, customer_id: Uuid, id: Uuid) -> StoreResult<Option<Address>> {
        sqlx::query_as::<_, AddressRow>("SELECT * FROM addresses WHERE id = $1 AND customer_id = $2")
            .bind(id)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Address::try_from)
            .transpose()
    }

    async fn insert_address(&self, a: &Address) -> StoreResult<Address> {
        let mut tx = self.pool.begin().await?;
        Self::lock_customer(&mut tx, a.customer_id).await?;
        let (existing,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM addresses WHERE customer_id = $1")
            .bind(a.customer_id)
            .fetch_one(&mut *tx)
            .await?;
        let is_default = existing == 0 || a.is_default;
        if is_default {
            sqlx::query("UPDATE addresses SET is_default = FALSE WHERE customer_id = $1 AND is_default")
                .bind(a.customer_id)
                .execute(&mut *tx)
                .await?;
        }
        let row = sqlx::query_as::<_, AddressRow>(
            "INSERT INTO addresses (id, customer_id, kind, is_default, recipient_name, phone_number, line1, line2, city, state, \
             country, zip_code, landmark, delivery_instructions, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) RETURNING *",
        )
        .bind(a.id).bind(a.customer_id).bind(a.kind.as_str()).bind(is_default).bind(&a.recipient_name).bind(&a.phone_number)
        .bind(&a.line1).bind(&a.line2).bind(&a.city).bind(&a.state).bind(&a.country).bind(&a.zip_code).bind(&a.landmark)
        .bind(&a.delivery_instructions).bind(a.created_at).bind(a.updated_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Address::try_from(row)
    }

    async fn update_address(&self, a: &Address) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE addresses SET kind = $3, recipient_name = $4, phone_number = $5, line1 = $6, line2 = $7, city = $8, state = $9, \
             country = $10, zip_code = $11, landmark = $12, delivery_instructions = $13, updated_at = $14 \
             WHERE id = $1 AND customer_id = $2",
        )
        .bind(a.id).bind(a.customer_id).bind(a.kind.as_str()).bind(&a.recipient_name).bind(&a.phone_number).bind(&a.line1)
        .bind(&a.line2).bind(&a.city).bind(&a.state).bind(&a.country).bind(&a.zip_code).bind(&a.landmark)
        .bind(&a.delivery_instructions).bind(a.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 { return Err(StoreError::NotFound); }
        Ok(())
    }

    async fn delete_address(&self, customer_id: Uuid, id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_customer(&mut tx, customer_id).await?;
        let (was_default,): (bool,) = sqlx::query_as("DELETE FROM addresses WHERE id = $1 AND customer_id = $2 RETURNING is_default")
            .bind(id)
            .bind(customer_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        if was_default {
            sqlx::query(
                "UPDATE addresses SET is_default = TRUE WHERE id = \
                 (SELECT id FROM addresses WHERE customer_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1)",
            )
            .bind(customer_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_default_address(&self, customer_id: Uuid, id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_customer(&mut tx, customer_id).await?;
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM addresses WHERE id = $1 AND customer_id = $2")
            .bind(id)
            .bind(customer_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() { return Err(StoreError::NotFound); }
        sqlx::query("UPDATE addresses SET is_default = FALSE WHERE customer_id = $1 AND is_default AND id <> $2")
            .bind(customer_id).bind(id).execute(&mut *tx).await?;
        sqlx::query("UPDATE addresses SET is_default = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cart(&self, owner: &CartOwner) -> StoreResult<Option<Cart>> {
        let (kind, key) = owner_columns(owner);
        let Some(row) = sqlx::query_as::<_, CartRow>("SELECT * FROM carts WHERE owner_kind = $1 AND owner_key = $2")
            .bind(kind)
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let item_rows = sqlx::query_as::<_, CartItemRow>(
            "SELECT id, product_id, variant_id, name, sku, variant_label, quantity, unit_price FROM cart_items WHERE cart_id = $1 ORDER BY position",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?;
        let items = item_rows
            .into_iter()
            .map(|r| {
                Ok(CartItem {
                    id: r.id,
                    product_id: r.product_id,
                    variant_id: r.variant_id,
                    name: r.name,
                    sku: r.sku,
                    variant_label: r.variant_label,
                    quantity: to_u32(r.quantity)?,
                    unit_price: Money::new(r.unit_price, &row.currency),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let owner = match row.owner_kind.as_str() {
            "session" => CartOwner::Session(row.owner_key),
            "customer" => CartOwner::Customer(row.owner_key.parse().map_err(|_| corrupt("cart owner", &row.owner_key))?),
            other => return Err(corrupt("cart owner kind", other)),
        };
        Ok(Some(Cart::restore(row.id, owner, items, row.currency, row.created_at, row.updated_at)))
    }

    async fn save_cart(&self, cart: &Cart) -> StoreResult<()> {
        let (kind, key) = owner_columns(cart.owner());
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM carts WHERE owner_kind = $1 AND owner_key = $2 AND id <> $3")
            .bind(kind).bind(&key).bind(cart.id()).execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO carts (id, owner_kind, owner_key, currency, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET owner_kind = EXCLUDED.owner_kind, owner_key = EXCLUDED.owner_key, updated_at = EXCLUDED.updated_at",
        )
        .bind(cart.id()).bind(kind).bind(&key).bind(cart.currency()).bind(cart.created_at()).bind(cart.updated_at())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM cart_items WHERE cart_id = $1").bind(cart.id()).execute(&mut *tx).await?;
        for (position, item) in cart.items().iter().enumerate() {
            sqlx::query(
                "INSERT INTO cart_items (id, cart_id, product_id, variant_id, name, sku, variant_label, quantity, unit_price, position) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(item.id).bind(cart.id()).bind(item.product_id).bind(item.variant_id).bind(&item.name).bind(&item.sku)
            .bind(&item.variant_label).bind(to_i32(item.quantity)?).bind(item.unit_price.amount()).bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_cart(&self, owner: &CartOwner) -> StoreResult<()> {
        let (kind, key) = owner_columns(owner);
        sqlx::query("DELETE FROM carts WHERE owner_kind = $1 AND owner_key = $2").bind(kind).bind(&key).execute(&self.pool).await?;
        Ok(())
    }

    async fn place_order(&self, order: &Order, cart_id: Uuid) -> StoreResult<PlaceOrderOutcome> {
        if let Some(key) = order.idempotency_key() {
            if let Some(existing) = self.find_by_idempotency_key(order.customer_id(), key).await? {
                return Ok(PlaceOrderOutcome::Existing(existing));
            }
        }

        let mut tx = self.pool.begin().await?;
        for line in lock_order(order.items()) {
            let quantity = to_i32(line.quantity)?;
            let reserved = match line.variant_id {
                Some(variant_id) => sqlx::query(
                    "UPDATE product_variants SET stock = stock - $1 WHERE id = $2 AND product_id = $3 AND stock >= $1",
                )
                .bind(quantity).bind(variant_id).bind(line.product_id)
                .execute(&mut *tx)
                .await?,
                None => sqlx::query("UPDATE products SET stock = stock - $1 WHERE id = $2 AND stock >= $1")
                    .bind(quantity).bind(line.product_id)
                    .execute(&mut *tx)
                    .await?,
            };
            if reserved.rows_affected() == 0 {
                return Err(StoreError::InsufficientStock { sku: line.sku.clone() });
            }
        }

        if let Err(err) = Self::insert_order_rows(&mut tx, order).await {
            drop(tx);
            let lost_race = matches!(&err, sqlx::Error::Database(db) if db.constraint() == Some("orders_idempotency_key_idx"));
            if let (true, Some(key)) = (lost_race, order.idempotency_key()) {
                if let Some(existing) = self.find_by_idempotency_key(order.customer_id(), key).await? {
                    return Ok(PlaceOrderOutcome::Existing(existing));
                }
            }
            return Err(err.into());
        }
        sqlx::query("DELETE FROM carts WHERE id = $1").bind(cart_id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(PlaceOrderOutcome::Placed)
    }

    async fn order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        self.hydrate_order(row).await
    }

    async fn order_by_number(&self, order_number: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE order_number = $1")
            .bind(order_number)
            .fetch_optional(&self.pool)
            .await?;
        self.hydrate_order(row).await
    }

    async fn order_by_idempotency_key(&self, customer_id: Uuid, key: &str) -> StoreResult<Option<Order>> {
        self.find_by_idempotency_key(Some(customer_id), key).await
    }

    async fn list_orders(&self, query: &OrderQuery) -> StoreResult<Page<Order>> {
        let filter = "($1::uuid IS NULL OR customer_id = $1) AND ($2::text IS NULL OR status = $2)";
        let status = query.status.map(OrderStatus::as_str);
        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM orders WHERE {filter}"))
            .bind(query.customer_id)
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, OrderRow>(&format!("SELECT * FROM orders WHERE {filter} ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"))
            .bind(query.customer_id)
            .bind(status)
            .bind(query.page.limit() as i64)
            .bind(query.page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(Page { items: self.hydrate_orders(rows).await?, total })
    }

    async fn commit_order(&self, order: &Order, expected_version: i64, commit: OrderCommit) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE orders SET status = $3, payment_status = $4, gateway_session_key = $5, payment = $6, tracking_number = $7, \
             status_reason = $8, refund_ref = $9, updated_at = $10, paid_at = $11, version = version + 1 \
             WHERE id = $1 AND version = $2",
        )
        .bind(order.id())
        .bind(expected_version)
        .bind(order.status().as_str())
        .bind(order.payment_status().as_str())
        .bind(order.gateway_session_key())
        .bind(order.payment().map(Json))
        .bind(order.tracking_number())
        .bind(order.status_reason())
        .bind(order.refund_ref())
        .bind(order.updated_at())
        .bind(order.paid_at())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM orders WHERE id = $1)")
                .bind(order.id())
                .fetch_one(&mut *tx)
                .await?;
            return Err(if exists { StoreError::Conflict } else { StoreError::NotFound });
        }

        if let Some(record) = &commit.payment_record {
            insert_payment_record(&mut tx, record).await?;
        }

        if commit.release_stock {
            for line in order.items() {
                let quantity = to_i32(line.quantity)?;
                match line.variant_id {
                    Some(variant_id) => sqlx::query("UPDATE product_variants SET stock = stock + $1 WHERE id = $2")
                        .bind(quantity).bind(variant_id).execute(&mut *tx).await?,
                    None => sqlx::query("UPDATE products SET stock = stock + $1 WHERE id = $2")
                        .bind(quantity).bind(line.product_id).execute(&mut *tx).await?,
                };
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn orders_awaiting_payment_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE status IN ('pending_payment', 'payment_failed') AND created_at < $1 ORDER BY created_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_orders(rows).await
    }

    async fn has_purchased(&self, customer_id: Uuid, product_id: Uuid) -> StoreResult<bool> {
        let (purchased,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM orders o JOIN order_items i ON i.order_id = o.id \
             WHERE o.customer_id = $1 AND i.product_id = $2 AND o.status IN ('paid', 'fulfilled', 'delivered'))",
        )
        .bind(customer_id)
        .bind(product_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(purchased)
    }

    async fn payment_record_exists(&self, dedupe_key: &str) -> StoreResult<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM payment_records WHERE dedupe_key = $1)")
            .bind(dedupe_key)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn insert_payment_record(&self, record: &PaymentRecord) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_payment_record(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_payment_record(&self, dedupe_key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM payment_records WHERE dedupe_key = $1").bind(dedupe_key).execute(&self.pool).await?;
        Ok(())
    }

    async fn payment_records(&self, order_id: Uuid) -> StoreResult<Vec<PaymentRecord>> {
        sqlx::query_as::<_, PaymentRecordRow>("SELECT * FROM payment_records WHERE order_id = $1 ORDER BY received_at")
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(PaymentRecord::try_from)
            .collect()
    }

    async fn insert_review(&self, r: &Review) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO reviews (id, product_id, customer_id, rating, title, body, verified_purchase, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(r.id).bind(r.product_id).bind(r.customer_id).bind(i16::from(r.rating.value())).bind(&r.title).bind(&r.body)
        .bind(r.verified_purchase).bind(r.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| duplicate_or(e, |_| "review"))?;
        Ok(())
    }

    async fn review(&self, id: Uuid) -> StoreResult<Option<Review>> {
        sqlx::query_as::<_, ReviewRow>("SELECT * FROM reviews WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Review::try_from)
            .transpose()
    }

    async fn delete_review(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM reviews WHERE id = $1").bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 { return Err(StoreError::NotFound); }
        Ok(())
    }

    async fn reviews_for_product(&self, product_id: Uuid, page: PageRequest) -> StoreResult<Page<Review>> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reviews WHERE product_id = $1")
            .bind(product_id)
            .fetch_one(&self.pool)
            .await?;
        let items = sqlx::query_as::<_, ReviewRow>("SELECT * FROM reviews WHERE product_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3")
            .bind(product_id)
            .bind(page.limit() as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Review::try_from)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Page { items, total })
    }

    async fn rating_summary(&self, product_id: Uuid) -> StoreResult<RatingSummary> {
        let ratings: Vec<(i16,)> = sqlx::query_as("SELECT rating FROM reviews WHERE product_id = $1")
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(RatingSummary::from_ratings(ratings.into_iter().filter_map(|(r,)| u8::try_from(r).ok())))
    }

    async fn add_to_wishlist(&self, entry: &WishlistEntry) -> StoreResult<bool> {
        let result = sqlx::query("INSERT INTO wishlist_items (customer_id, product_id, added_at) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING")
            .bind(entry.customer_id)
            .bind(entry.product_id)
            .bind(entry.added_at)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound,
                _ => StoreError::Database(e),
            })?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_from_wishlist(&self, customer_id: Uuid, product_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM wishlist_items WHERE customer_id = $1 AND product_id = $2")
            .bind(customer_id)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn wishlist(&self, customer_id: Uuid) -> StoreResult<Vec<(WishlistEntry, Product)>> {
        let entries: Vec<(Uuid, DateTime<Utc>)> =
            sqlx::query_as("SELECT product_id, added_at FROM wishlist_items WHERE customer_id = $1 ORDER BY added_at DESC")
                .bind(customer_id)
                .fetch_all(&self.pool)
                .await?;
        let ids: Vec<Uuid> = entries.iter().map(|(id, _)| *id).collect();
        let rows = sqlx::query_as::<_, ProductRow>("SELECT * FROM products WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
        let mut products: HashMap<Uuid, Product> = self.hydrate_products(rows).await?.into_iter().map(|p| (p.id, p)).collect();
        Ok(entries
            .into_iter()
            .filter_map(|(product_id, added_at)| {
                products.remove(&product_id).map(|p| (WishlistEntry { customer_id, product_id, added_at }, p))
            })
            .collect())
    }
}

/// Stock rows are locked in one global order so concurrent checkouts cannot deadlock.
fn lock_order(lines: &[OrderLine]) -> Vec<&OrderLine> {
    let mut sorted: Vec<&OrderLine> = lines.iter().collect();
    sorted.sort_by_key(|line| (line.product_id, line.variant_id));
    sorted
}

async fn insert_payment_record(tx: &mut Transaction<'_, Postgres>, r: &PaymentRecord) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO payment_records (id, order_id, dedupe_key, tran_id, val_id, gateway_status, disposition, amount, currency, payload, received_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(r.id).bind(r.order_id).bind(&r.dedupe_key).bind(&r.tran_id).bind(&r.val_id).bind(&r.gateway_status)
    .bind(r.disposition.as_str()).bind(r.amount).bind(&r.currency).bind(&r.payload).bind(r.received_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| duplicate_or(e, |_| "payment notification"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_rows_lock_in_the_same_order_for_any_cart() {
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let line = |product_id, variant_id| OrderLine::new(product_id, variant_id, "Kurta".into(), None, "KURTA-1".into(), 1, Decimal::ONE);
        let forward = vec![line(a, None), line(b, Some(Uuid::from_u128(9))), line(b, Some(Uuid::from_u128(3)))];
        let backward: Vec<OrderLine> = forward.iter().rev().cloned().collect();

        let keys = |lines: &[OrderLine]| lock_order(lines).iter().map(|l| (l.product_id, l.variant_id)).collect::<Vec<_>>();
        assert_eq!(keys(&forward), keys(&backward));
        assert_eq!(keys(&forward)[0], (a, None));
        assert_eq!(keys(&forward)[1], (b, Some(Uuid::from_u128(3))));
    }
}
