//! In-process store.
//!
//! One `tokio::sync::Mutex` guards all state, so every trait method is
//! trivially atomic. Used for local development (`STORAGE_BACKEND=memory`)
//! and by the service and HTTP tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AccountToken, CustomerFlag, CustomerQuery, CustomerStats, OrderCommit, OrderQuery, Page, PageRequest,
    PaymentRecord, PlaceOrderOutcome, ProductQuery, ProductSort, Session, StoreError, StoreResult, StorefrontStore,
    TokenPurpose,
};
use crate::domain::aggregates::customer::default_successor;
use crate::domain::aggregates::{
    Address, Brand, Cart, CartOwner, Category, Customer, Order, Product, RatingSummary, Review, WishlistEntry,
};

#[derive(Default)]
struct Inner {
    categories: Vec<Category>,
    brands: Vec<Brand>,
    products: HashMap<Uuid, Product>,
    customers: HashMap<Uuid, Customer>,
    sessions: HashMap<String, Session>,
    tokens: HashMap<String, (AccountToken, bool)>,
    addresses: HashMap<Uuid, Address>,
    carts: HashMap<CartOwner, Cart>,
    orders: HashMap<Uuid, Order>,
    payments: Vec<PaymentRecord>,
    reviews: HashMap<Uuid, Review>,
    wishlist: Vec<WishlistEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

fn paginate<T: Clone>(mut items: Vec<T>, page: PageRequest) -> Page<T> {
    let total = items.len() as i64;
    let items = items.drain(..).skip(page.offset()).take(page.limit()).collect();
    Page { items, total }
}

fn stored(order: &Order, version: i64) -> Order {
    let mut copy = order.clone();
    copy.version = version;
    copy.events.clear();
    copy
}

impl Inner {
    fn customer_conflict(&self, candidate: &Customer) -> Option<&'static str> {
        self.customers.values().filter(|c| c.id != candidate.id).find_map(|c| {
            if c.username.eq_ignore_ascii_case(&candidate.username) {
                Some("username")
            } else if c.email.eq_ignore_ascii_case(&candidate.email) {
                Some("email")
            } else if c.phone_number.is_some() && c.phone_number == candidate.phone_number {
                Some("phone number")
            } else {
                None
            }
        })
    }

    fn stock_slot(&mut self, product_id: Uuid, variant_id: Option<Uuid>) -> Option<&mut u32> {
        let product = self.products.get_mut(&product_id)?;
        match variant_id {
            Some(id) => product.variants.iter_mut().find(|v| v.id == id).map(|v| &mut v.stock),
            None => Some(&mut product.stock),
        }
    }

    fn release(&mut self, order: &Order) {
        for line in order.items() {
            if let Some(product) = self.products.get_mut(&line.product_id) {
                // A variant deleted since placement has nothing left to restock.
                let _ = product.add_inventory(line.variant_id, line.quantity);
            }
        }
    }
}

#[async_trait]
impl StorefrontStore for MemoryStore {
    async fn insert_category(&self, category: &Category) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.categories.iter().any(|c| c.slug == category.slug) { return Err(StoreError::Duplicate("category")); }
        inner.categories.push(category.clone());
        Ok(())
    }

    async fn list_categories(&self) -> StoreResult<Vec<Category>> {
        let mut categories = self.inner.lock().await.categories.clone();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(categories)
    }

    async fn insert_brand(&self, brand: &Brand) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.brands.iter().any(|b| b.slug == brand.slug) { return Err(StoreError::Duplicate("brand")); }
        inner.brands.push(brand.clone());
        Ok(())
    }

    async fn list_brands(&self) -> StoreResult<Vec<Brand>> {
        let mut brands = self.inner.lock().await.brands.clone();
        brands.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(brands)
    }

    async fn insert_product(&self, product: &Product) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.products.values().any(|p| p.sku == product.sku) { return Err(StoreError::Duplicate("sku")); }
        inner.products.insert(product.id, product.clone());
        Ok(())
    }

    async fn update_product(&self, product: &Product) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.products.values().any(|p| p.id != product.id && p.sku == product.sku) {
            return Err(StoreError::Duplicate("sku"));
        }
        let existing = inner.products.get_mut(&product.id).ok_or(StoreError::NotFound)?;
        let mut updated = product.clone();
        updated.stock = existing.stock;
        for variant in &mut updated.variants {
            if let Some(current) = existing.variants.iter().find(|v| v.id == variant.id) {
                variant.stock = current.stock;
            }
        }
        *existing = updated;
        Ok(())
    }

    async fn product(&self, id: Uuid) -> StoreResult<Option<Product>> {
        Ok(self.inner.lock().await.products.get(&id).cloned())
    }

    async fn product_by_sku(&self, sku: &str) -> StoreResult<Option<Product>> {
        Ok(self.inner.lock().await.products.values().find(|p| p.sku.as_str().eq_ignore_ascii_case(sku)).cloned())
    }

    async fn list_products(&self, query: &ProductQuery) -> StoreResult<Page<Product>> {
        let inner = self.inner.lock().await;
        let category_id = match &query.category {
            Some(slug) => match inner.categories.iter().find(|c| &c.slug == slug) {
                Some(c) => Some(c.id),
                None => return Ok(Page { items: vec![], total: 0 }),
            },
            None => None,
        };
        let brand_id = match &query.brand {
            Some(slug) => match inner.brands.iter().find(|b| &b.slug == slug) {
                Some(b) => Some(b.id),
                None => return Ok(Page { items: vec![], total: 0 }),
            },
            None => None,
        };
        let needle = query.search.as_ref().map(|s| s.to_lowercase());
        let mut matches: Vec<Product> = inner
            .products
            .values()
            .filter(|p| query.include_inactive || p.is_active())
            .filter(|p| category_id.map_or(true, |id| p.category_id == Some(id)))
            .filter(|p| brand_id.map_or(true, |id| p.brand_id == Some(id)))
            .filter(|p| needle.as_ref().map_or(true, |n| p.name.to_lowercase().contains(n) || p.description.to_lowercase().contains(n)))
            .filter(|p| query.min_price.map_or(true, |min| p.current_price() >= min))
            .filter(|p| query.max_price.map_or(true, |max| p.current_price() <= max))
            .filter(|p| query.featured.map_or(true, |f| p.is_featured == f))
            .filter(|p| query.new_arrival.map_or(true, |f| p.is_new_arrival == f))
            .filter(|p| query.on_sale.map_or(true, |f| p.is_on_sale() == f))
            .cloned()
            .collect();
        match query.sort {
            ProductSort::Newest => matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))),
            ProductSort::PriceAsc => matches.sort_by(|a, b| a.current_price().cmp(&b.current_price())),
            ProductSort::PriceDesc => matches.sort_by(|a, b| b.current_price().cmp(&a.current_price())),
            ProductSort::Name => matches.sort_by(|a, b| a.name.cmp(&b.name)),
        }
        Ok(paginate(matches, query.page))
    }

    async fn add_stock(&self, product_id: Uuid, variant_id: Option<Uuid>, quantity: u32) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let product = inner.products.get_mut(&product_id).ok_or(StoreError::NotFound)?;
        product.add_inventory(variant_id, quantity).map_err(|_| StoreError::NotFound)
    }

    async fn insert_customer(&self, customer: &Customer) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(field) = inner.customer_conflict(customer) { return Err(StoreError::Duplicate(field)); }
        inner.customers.insert(customer.id, customer.clone());
        Ok(())
    }

    async fn update_customer(&self, customer: &Customer) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.customers.contains_key(&customer.id) { return Err(StoreError::NotFound); }
        if let Some(field) = inner.customer_conflict(customer) { return Err(StoreError::Duplicate(field)); }
        inner.customers.insert(customer.id, customer.clone());
        Ok(())
    }

    async fn customer(&self, id: Uuid) -> StoreResult<Option<Customer>> {
        Ok(self.inner.lock().await.customers.get(&id).cloned())
    }

    async fn customer_by_login(&self, login: &str) -> StoreResult<Option<Customer>> {
        let login = login.trim();
        Ok(self
            .inner
            .lock()
            .await
            .customers
            .values()
            .find(|c| c.username.eq_ignore_ascii_case(login) || c.email.eq_ignore_ascii_case(login))
            .cloned())
    }

    async fn list_customers(&self, query: &CustomerQuery) -> StoreResult<Page<Customer>> {
        let inner = self.inner.lock().await;
        let needle = query.search.as_ref().map(|s| s.to_lowercase());
        let mut matches: Vec<Customer> = inner
            .customers
            .values()
            .filter(|c| {
                needle.as_ref().map_or(true, |n| {
                    c.username.to_lowercase().contains(n)
                        || c.email.contains(n)
                        || c.full_name.to_lowercase().contains(n)
                        || c.phone_number.as_ref().is_some_and(|p| p.contains(n))
                })
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(matches, query.page))
    }

    async fn set_customer_flag(&self, ids: &[Uuid], flag: CustomerFlag, value: bool) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut changed = 0;
        for id in ids {
            if let Some(customer) = inner.customers.get_mut(id) {
                match flag {
                    CustomerFlag::Verified => customer.is_verified = value,
                    CustomerFlag::Active => customer.is_active = value,
                }
                customer.touch();
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_customer(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.customers.remove(&id).ok_or(StoreError::NotFound)?;
        inner.addresses.retain(|_, a| a.customer_id != id);
        inner.carts.remove(&CartOwner::Customer(id));
        inner.sessions.retain(|_, s| s.customer_id != id);
        inner.tokens.retain(|_, (t, _)| t.customer_id != id);
        inner.reviews.retain(|_, r| r.customer_id != id);
        inner.wishlist.retain(|w| w.customer_id != id);
        for order in inner.orders.values_mut().filter(|o| o.customer_id == Some(id)) {
            order.customer_id = None;
        }
        Ok(())
    }

    async fn customer_stats(&self, id: Uuid) -> StoreResult<CustomerStats> {
        let inner = self.inner.lock().await;
        Ok(CustomerStats {
            total_orders: inner.orders.values().filter(|o| o.customer_id == Some(id)).count() as i64,
            total_reviews: inner.reviews.values().filter(|r| r.customer_id == id).count() as i64,
            total_wishlist_items: inner.wishlist.iter().filter(|w| w.customer_id == id).count() as i64,
        })
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        self.inner.lock().await.sessions.insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn session(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        Ok(self.inner.lock().await.sessions.get(token_hash).cloned())
    }

    async fn delete_session(&self, token_hash: &str) -> StoreResult<()> {
        self.inner.lock().await.sessions.remove(token_hash);
        Ok(())
    }

    async fn delete_sessions_except(&self, customer_id: Uuid, keep: Option<&str>) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .sessions
            .retain(|hash, s| s.customer_id != customer_id || Some(hash.as_str()) == keep);
        Ok(())
    }

    async fn insert_token(&self, token: &AccountToken) -> StoreResult<()> {
        self.inner.lock().await.tokens.insert(token.token_hash.clone(), (token.clone(), false));
        Ok(())
    }

    async fn consume_token(&self, token_hash: &str, purpose: TokenPurpose, now: DateTime<Utc>) -> StoreResult<Option<Uuid>> {
        let mut inner = self.inner.lock().await;
        match inner.tokens.get_mut(token_hash) {
            Some((token, used)) if !*used && token.purpose == purpose && token.expires_at > now => {
                *used = true;
                Ok(Some(token.customer_id))
            }
            _ => Ok(None),
        }
    }

    async fn addresses(&self, customer_id: Uuid) -> StoreResult<Vec<Address>> {
        let inner = self.inner.lock().await;
        let mut list: Vec<Address> = inner.addresses.values().filter(|a| a.customer_id == customer_id).cloned().collect();
        list.sort_by(|a, b| b.is_default.cmp(&a.is_default).then(b.created_at.cmp(&a.created_at)));
        Ok(list)
    }

    async fn address(&self, customer_id: Uuid, id: Uuid) -> StoreResult<Option<Address>> {
        Ok(self.inner.lock().await.addresses.get(&id).filter(|a| a.customer_id == customer_id).cloned())
    }

    async fn insert_address(&self, address: &Address) -> StoreResult<Address> {
        let mut inner = self.inner.lock().await;
        let first = !inner.addresses.values().any(|a| a.customer_id == address.customer_id);
        let mut stored = address.clone();
        stored.is_default = first || address.is_default;
        if stored.is_default {
            for other in inner.addresses.values_mut().filter(|a| a.customer_id == address.customer_id) {
                other.is_default = false;
            }
        }
        inner.addresses.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_address(&self, address: &Address) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let existing = inner
            .addresses
            .get_mut(&address.id)
            .filter(|a| a.customer_id == address.customer_id)
            .ok_or(StoreError::NotFound)?;
        let is_default = existing.is_default;
        *existing = Address { is_default, ..address.clone() };
        Ok(())
    }

    async fn delete_address(&self, customer_id: Uuid, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.addresses.get(&id).is_some_and(|a| a.customer_id == customer_id) {
            return Err(StoreError::NotFound);
        }
        let removed = inner.addresses.remove(&id).ok_or(StoreError::NotFound)?;
        if removed.is_default {
            let successor = default_successor(inner.addresses.values().filter(|a| a.customer_id == customer_id), id);
            if let Some(next) = successor.and_then(|sid| inner.addresses.get_mut(&sid)) {
                next.is_default = true;
            }
        }
        Ok(())
    }

    async fn set_default_address(&self, customer_id: Uuid, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.addresses.get(&id).is_some_and(|a| a.customer_id == customer_id) {
            return Err(StoreError::NotFound);
        }
        for address in inner.addresses.values_mut().filter(|a| a.customer_id == customer_id) {
            address.is_default = address.id == id;
        }
        Ok(())
    }

    async fn cart(&self, owner: &CartOwner) -> StoreResult<Option<Cart>> {
        Ok(self.inner.lock().await.carts.get(owner).cloned())
    }

    async fn save_cart(&self, cart: &Cart) -> StoreResult<()> {
        self.inner.lock().await.carts.insert(cart.owner().clone(), cart.clone());
        Ok(())
    }

    async fn delete_cart(&self, owner: &CartOwner) -> StoreResult<()> {
        self.inner.lock().await.carts.remove(owner);
        Ok(())
    }

    async fn place_order(&self, order: &Order, cart_id: Uuid) -> StoreResult<PlaceOrderOutcome> {
        let mut inner = self.inner.lock().await;
        if let Some(key) = order.idempotency_key() {
            let previous = inner
                .orders
                .values()
                .find(|o| o.customer_id == order.customer_id && o.idempotency_key() == Some(key));
            if let Some(previous) = previous {
                return Ok(PlaceOrderOutcome::Existing(previous.clone()));
            }
        }

        let mut demand: HashMap<(Uuid, Option<Uuid>), (u32, &str)> = HashMap::new();
        for line in order.items() {
            let entry = demand.entry((line.product_id, line.variant_id)).or_insert((0, line.sku.as_str()));
            entry.0 = entry.0.saturating_add(line.quantity);
        }
        for (&(product_id, variant_id), &(wanted, sku)) in &demand {
            let available = inner.stock_slot(product_id, variant_id).map(|s| *s).unwrap_or(0);
            if available < wanted {
                return Err(StoreError::InsufficientStock { sku: sku.to_string() });
            }
        }
        for (&(product_id, variant_id), &(wanted, sku)) in &demand {
            let product = inner.products.get_mut(&product_id).ok_or(StoreError::NotFound)?;
            product.remove_inventory(variant_id, wanted).map_err(|_| StoreError::InsufficientStock { sku: sku.to_string() })?;
        }

        inner.orders.insert(order.id(), stored(order, 0));
        inner.carts.retain(|_, cart| cart.id() != cart_id);
        Ok(PlaceOrderOutcome::Placed)
    }

    async fn order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.inner.lock().await.orders.get(&id).cloned())
    }

    async fn order_by_number(&self, order_number: &str) -> StoreResult<Option<Order>> {
        Ok(self.inner.lock().await.orders.values().find(|o| o.order_number() == order_number).cloned())
    }

    async fn order_by_idempotency_key(&self, customer_id: Uuid, key: &str) -> StoreResult<Option<Order>> {
        Ok(self
            .inner
            .lock()
            .await
            .orders
            .values()
            .find(|o| o.customer_id == Some(customer_id) && o.idempotency_key() == Some(key))
            .cloned())
    }

    async fn list_orders(&self, query: &OrderQuery) -> StoreResult<Page<Order>> {
        let inner = self.inner.lock().await;
        let mut matches: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| query.customer_id.map_or(true, |id| o.customer_id == Some(id)))
            .filter(|o| query.status.map_or(true, |s| o.status() == s))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then(b.id().cmp(&a.id())));
        Ok(paginate(matches, query.page))
    }

    async fn commit_order(&self, order: &Order, expected_version: i64, commit: OrderCommit) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let current = inner.orders.get(&order.id()).ok_or(StoreError::NotFound)?;
        if current.version() != expected_version { return Err(StoreError::Conflict); }
        if let Some(record) = &commit.payment_record {
            if inner.payments.iter().any(|p| p.dedupe_key == record.dedupe_key) {
                return Err(StoreError::Duplicate("payment notification"));
            }
        }
        if commit.release_stock { inner.release(order); }
        if let Some(record) = commit.payment_record { inner.payments.push(record); }
        inner.orders.insert(order.id(), stored(order, expected_version + 1));
        Ok(())
    }

    async fn orders_awaiting_payment_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Order>> {
        Ok(self
            .inner
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.status().awaits_payment() && o.created_at() < cutoff)
            .cloned()
            .collect())
    }

    async fn has_purchased(&self, customer_id: Uuid, product_id: Uuid) -> StoreResult<bool> {
        Ok(self.inner.lock().await.orders.values().any(|o| {
            o.customer_id == Some(customer_id) && o.status().is_captured() && o.items().iter().any(|l| l.product_id == product_id)
        }))
    }

    async fn payment_record_exists(&self, dedupe_key: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().await.payments.iter().any(|p| p.dedupe_key == dedupe_key))
    }

    async fn insert_payment_record(&self, record: &PaymentRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.payments.iter().any(|p| p.dedupe_key == record.dedupe_key) {
            return Err(StoreError::Duplicate("payment notification"));
        }
        inner.payments.push(record.clone());
        Ok(())
    }

    async fn delete_payment_record(&self, dedupe_key: &str) -> StoreResult<()> {
        self.inner.lock().await.payments.retain(|p| p.dedupe_key != dedupe_key);
        Ok(())
    }

    async fn payment_records(&self, order_id: Uuid) -> StoreResult<Vec<PaymentRecord>> {
        Ok(self.inner.lock().await.payments.iter().filter(|p| p.order_id == Some(order_id)).cloned().collect())
    }

    async fn insert_review(&self, review: &Review) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.reviews.values().any(|r| r.product_id == review.product_id && r.customer_id == review.customer_id) {
            return Err(StoreError::Duplicate("review"));
        }
        inner.reviews.insert(review.id, review.clone());
        Ok(())
    }

    async fn review(&self, id: Uuid) -> StoreResult<Option<Review>> {
        Ok(self.inner.lock().await.reviews.get(&id).cloned())
    }

    async fn delete_review(&self, id: Uuid) -> StoreResult<()> {
        self.inner.lock().await.reviews.remove(&id).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn reviews_for_product(&self, product_id: Uuid, page: PageRequest) -> StoreResult<Page<Review>> {
        let inner = self.inner.lock().await;
        let mut reviews: Vec<Review> = inner.reviews.values().filter(|r| r.product_id == product_id).cloned().collect();
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(reviews, page))
    }

    async fn rating_summary(&self, product_id: Uuid) -> StoreResult<RatingSummary> {
        let inner = self.inner.lock().await;
        Ok(RatingSummary::from_ratings(
            inner.reviews.values().filter(|r| r.product_id == product_id).map(|r| r.rating.value()),
        ))
    }

    async fn add_to_wishlist(&self, entry: &WishlistEntry) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.products.contains_key(&entry.product_id) { return Err(StoreError::NotFound); }
        if inner.wishlist.iter().any(|w| w.customer_id == entry.customer_id && w.product_id == entry.product_id) {
            return Ok(false);
        }
        inner.wishlist.push(entry.clone());
        Ok(true)
    }

    async fn remove_from_wishlist(&self, customer_id: Uuid, product_id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.wishlist.len();
        inner.wishlist.retain(|w| !(w.customer_id == customer_id && w.product_id == product_id));
        Ok(inner.wishlist.len() != before)
    }

    async fn wishlist(&self, customer_id: Uuid) -> StoreResult<Vec<(WishlistEntry, Product)>> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<(WishlistEntry, Product)> = inner
            .wishlist
            .iter()
            .filter(|w| w.customer_id == customer_id)
            .filter_map(|w| inner.products.get(&w.product_id).map(|p| (w.clone(), p.clone())))
            .collect();
        entries.sort_by(|a, b| b.0.added_at.cmp(&a.0.added_at));
        Ok(entries)
    }
}
