//! Staff endpoints: catalog editing, fulfilment, refunds, customer moderation.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::auth::Staff;
use super::catalog::ProductParams;
use super::orders::OrderParams;
use super::{AppState, PaginatedResponse, ValidJson};
use crate::domain::aggregates::{Brand, Category, Customer, Order, Product};
use crate::services::accounts::ModerationAction;
use crate::services::catalog::{NewProduct, NewVariant, ProductCard, ProductDetail, ProductUpdate};
use crate::store::{CustomerQuery, PageRequest};
use crate::Result;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/products", get(list_products).post(create_product))
        .route("/admin/products/:id", get(get_product).patch(update_product).delete(archive_product))
        .route("/admin/products/:id/variants", post(add_variant))
        .route("/admin/products/:id/stock", post(restock))
        .route("/admin/categories", post(create_category))
        .route("/admin/brands", post(create_brand))
        .route("/admin/orders", get(list_orders))
        .route("/admin/orders/:id", get(get_order))
        .route("/admin/orders/:id/ship", post(ship_order))
        .route("/admin/orders/:id/deliver", post(deliver_order))
        .route("/admin/orders/:id/cancel", post(cancel_order))
        .route("/admin/orders/:id/refund", post(refund_order))
        .route("/admin/customers", get(list_customers))
        .route("/admin/customers/moderate", post(moderate_customers))
}

// --- catalog ---

async fn list_products(State(s): State<AppState>, _: Staff, Query(p): Query<ProductParams>) -> Result<Json<PaginatedResponse<ProductCard>>> {
    let query = p.into_query(true);
    let products = s.catalog.list_products(&query).await?;
    Ok(Json(PaginatedResponse::new(products.map(ProductCard::from), query.page)))
}

async fn create_product(State(s): State<AppState>, _: Staff, ValidJson(r): ValidJson<NewProduct>) -> Result<(StatusCode, Json<Product>)> {
    Ok((StatusCode::CREATED, Json(s.catalog.create_product(r).await?)))
}

async fn get_product(State(s): State<AppState>, _: Staff, Path(id): Path<Uuid>) -> Result<Json<ProductDetail>> {
    Ok(Json(s.catalog.product_detail(id, true).await?))
}

async fn update_product(State(s): State<AppState>, _: Staff, Path(id): Path<Uuid>, ValidJson(r): ValidJson<ProductUpdate>) -> Result<Json<Product>> {
    Ok(Json(s.catalog.update_product(id, r).await?))
}

async fn archive_product(State(s): State<AppState>, _: Staff, Path(id): Path<Uuid>) -> Result<Json<Product>> {
    Ok(Json(s.catalog.archive_product(id).await?))
}

async fn add_variant(State(s): State<AppState>, _: Staff, Path(id): Path<Uuid>, ValidJson(r): ValidJson<NewVariant>) -> Result<(StatusCode, Json<Product>)> {
    Ok((StatusCode::CREATED, Json(s.catalog.add_variant(id, r).await?)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RestockRequest {
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1))]
    pub quantity: u32,
}

async fn restock(State(s): State<AppState>, _: Staff, Path(id): Path<Uuid>, ValidJson(r): ValidJson<RestockRequest>) -> Result<Json<Product>> {
    Ok(Json(s.catalog.restock(id, r.variant_id, r.quantity).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CategoryRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
}

async fn create_category(State(s): State<AppState>, _: Staff, ValidJson(r): ValidJson<CategoryRequest>) -> Result<(StatusCode, Json<Category>)> {
    Ok((StatusCode::CREATED, Json(s.catalog.create_category(&r.name, r.description, r.parent_id).await?)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct BrandRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub description: Option<String>,
}

async fn create_brand(State(s): State<AppState>, _: Staff, ValidJson(r): ValidJson<BrandRequest>) -> Result<(StatusCode, Json<Brand>)> {
    Ok((StatusCode::CREATED, Json(s.catalog.create_brand(&r.name, r.description).await?)))
}

// --- orders ---

async fn list_orders(State(s): State<AppState>, _: Staff, Query(p): Query<OrderParams>) -> Result<Json<PaginatedResponse<Order>>> {
    let query = p.into_query();
    Ok(Json(PaginatedResponse::new(s.orders.list(&query).await?, query.page)))
}

async fn get_order(State(s): State<AppState>, _: Staff, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(s.orders.get(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ShipRequest {
    pub tracking_number: Option<String>,
}

async fn ship_order(State(s): State<AppState>, _: Staff, Path(id): Path<Uuid>, Json(r): Json<ShipRequest>) -> Result<Json<Order>> {
    let tracking = r.tracking_number.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
    Ok(Json(s.orders.ship(id, tracking).await?))
}

async fn deliver_order(State(s): State<AppState>, _: Staff, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(s.orders.deliver(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

async fn cancel_order(State(s): State<AppState>, staff: Staff, Path(id): Path<Uuid>, Json(r): Json<ReasonRequest>) -> Result<Json<Order>> {
    let reason = r.reason.unwrap_or_else(|| format!("Cancelled by {}", staff.0.username));
    Ok(Json(s.orders.cancel(id, &reason).await?))
}

async fn refund_order(State(s): State<AppState>, _: Staff, Path(id): Path<Uuid>, Json(r): Json<ReasonRequest>) -> Result<Json<Order>> {
    let remarks = r.reason.unwrap_or_else(|| "Refund".to_string());
    Ok(Json(s.orders.refund(id, &remarks).await?))
}

// --- customers ---

#[derive(Debug, Default, Deserialize)]
pub struct CustomerParams {
    pub search: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

async fn list_customers(State(s): State<AppState>, _: Staff, Query(p): Query<CustomerParams>) -> Result<Json<PaginatedResponse<Customer>>> {
    let query = CustomerQuery {
        search: p.search.map(|q| q.trim().to_string()).filter(|q| !q.is_empty()),
        page: PageRequest::new(p.page, p.per_page),
    };
    Ok(Json(PaginatedResponse::new(s.accounts.list_customers(&query).await?, query.page)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ModerationRequest {
    #[validate(length(min = 1, max = 500))]
    pub ids: Vec<Uuid>,
    pub action: ModerationAction,
}

#[derive(Debug, Serialize)]
pub struct ModerationResponse {
    pub updated: u64,
}

async fn moderate_customers(State(s): State<AppState>, _: Staff, ValidJson(r): ValidJson<ModerationRequest>) -> Result<Json<ModerationResponse>> {
    Ok(Json(ModerationResponse { updated: s.accounts.moderate(&r.ids, r.action).await? }))
}

#[cfg(test)]
mod tests {
    use super::super::orders::tests::{shipping, shopper_with_cart};
    use super::super::test_support::TestApp;
    use crate::payment::fake::FakeGateway;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn shoppers_cannot_reach_admin_routes() {
        let app = TestApp::new();
        let token = app.sign_up("shopper").await;
        let (status, _) = app.json(Method::GET, "/api/v1/admin/orders", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = app.json(Method::GET, "/api/v1/admin/orders", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn variants_and_restock() {
        let app = TestApp::new();
        let staff = app.sign_up_staff("admin").await;
        let (_, product) = app
            .json(Method::POST, "/api/v1/admin/products", Some(&staff), Some(json!({ "name": "Polo Shirt", "price": "900" })))
            .await;
        assert_eq!(product["status"], "draft");
        let id = product["id"].as_str().unwrap();

        let (status, with_variant) = app
            .json(
                Method::POST,
                &format!("/api/v1/admin/products/{id}/variants"),
                Some(&staff),
                Some(json!({ "name": "Size", "value": "M", "stock": 2 })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{with_variant}");
        let variant_id = with_variant["variants"][0]["id"].as_str().unwrap();

        let (status, restocked) = app
            .json(
                Method::POST,
                &format!("/api/v1/admin/products/{id}/stock"),
                Some(&staff),
                Some(json!({ "variant_id": variant_id, "quantity": 3 })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{restocked}");
        assert_eq!(restocked["variants"][0]["stock"], 5);

        let (_, listed) = app.json(Method::GET, "/api/v1/admin/products", Some(&staff), None).await;
        assert_eq!(listed["total"], 1);
    }

    #[tokio::test]
    async fn fulfil_and_refund_a_paid_order() {
        let app = TestApp::new();
        let (token, product_id) = shopper_with_cart(&app, 2).await;
        let (_, order) = app.json(Method::POST, "/api/v1/checkout", Some(&token), Some(shipping())).await;
        let number = order["order_number"].as_str().unwrap();
        let id = order["id"].as_str().unwrap();
        let total = order["totals"]["total"].as_str().unwrap().parse().unwrap();
        app.gateway.confirm("VAL-9", number, total, "BDT");
        app.state.reconciler.handle(&FakeGateway::notification("VALID", number, Some("VAL-9"))).await.unwrap();

        let staff = app.sign_up_staff("clerk").await;
        let (status, shipped) = app
            .json(Method::POST, &format!("/api/v1/admin/orders/{id}/ship"), Some(&staff), Some(json!({ "tracking_number": "TRK-1" })))
            .await;
        assert_eq!(status, StatusCode::OK, "{shipped}");
        assert_eq!(shipped["tracking_number"], "TRK-1");

        let (status, _) = app.json(Method::POST, &format!("/api/v1/admin/orders/{id}/cancel"), Some(&staff), Some(json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, refunded) = app.json(Method::POST, &format!("/api/v1/admin/orders/{id}/refund"), Some(&staff), Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK, "{refunded}");
        assert_eq!(refunded["status"], "refunded");
        assert_eq!(app.gateway.refunds.lock().unwrap().len(), 1);

        let (_, product) = app.json(Method::GET, &format!("/api/v1/products/{product_id}"), None, None).await;
        assert_eq!(product["stock"], 1);
    }

    #[tokio::test]
    async fn deactivated_customers_lose_their_sessions() {
        let app = TestApp::new();
        let staff = app.sign_up_staff("admin").await;
        let token = app.sign_up("shopper").await;
        let (_, found) = app.json(Method::GET, "/api/v1/admin/customers?search=shopper", Some(&staff), None).await;
        assert_eq!(found["total"], 1);
        let id = found["data"][0]["id"].clone();

        let (status, body) = app
            .json(Method::POST, "/api/v1/admin/customers/moderate", Some(&staff), Some(json!({ "ids": [id], "action": "deactivate" })))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["updated"], 1);

        let (status, _) = app.json(Method::GET, "/api/v1/account/profile", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
