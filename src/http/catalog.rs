//! Public catalog browsing and product reviews.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::auth::CurrentCustomer;
use super::{AppState, PageParams, PaginatedResponse, ValidJson};
use crate::domain::aggregates::{Brand, Category, Review};
use crate::services::catalog::{NewReview, ProductCard, ProductDetail};
use crate::store::{PageRequest, ProductQuery, ProductSort};
use crate::Result;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/products", get(list_products))
        .route("/products/:id", get(get_product))
        .route("/products/:id/reviews", get(list_reviews).post(write_review))
        .route("/reviews/:id", delete(delete_review))
        .route("/categories", get(list_categories))
        .route("/brands", get(list_brands))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductParams {
    pub category: Option<String>,
    pub brand: Option<String>,
    pub search: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub featured: Option<bool>,
    pub new_arrival: Option<bool>,
    pub on_sale: Option<bool>,
    pub sort: Option<ProductSort>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl ProductParams {
    pub fn into_query(self, include_inactive: bool) -> ProductQuery {
        ProductQuery {
            category: self.category.filter(|c| !c.is_empty()),
            brand: self.brand.filter(|b| !b.is_empty()),
            search: self.search.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            min_price: self.min_price,
            max_price: self.max_price,
            featured: self.featured,
            new_arrival: self.new_arrival,
            on_sale: self.on_sale,
            sort: self.sort.unwrap_or_default(),
            include_inactive,
            page: PageRequest::new(self.page, self.per_page),
        }
    }
}

async fn list_products(State(s): State<AppState>, Query(p): Query<ProductParams>) -> Result<Json<PaginatedResponse<ProductCard>>> {
    let query = p.into_query(false);
    let products = s.catalog.list_products(&query).await?;
    Ok(Json(PaginatedResponse::new(products.map(ProductCard::from), query.page)))
}

async fn get_product(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ProductDetail>> {
    Ok(Json(s.catalog.product_detail(id, false).await?))
}

async fn list_reviews(State(s): State<AppState>, Path(id): Path<Uuid>, Query(p): Query<PageParams>) -> Result<Json<PaginatedResponse<Review>>> {
    let page = p.request();
    Ok(Json(PaginatedResponse::new(s.catalog.reviews(id, page).await?, page)))
}

async fn write_review(
    State(s): State<AppState>,
    me: CurrentCustomer,
    Path(id): Path<Uuid>,
    ValidJson(r): ValidJson<NewReview>,
) -> Result<(StatusCode, Json<Review>)> {
    Ok((StatusCode::CREATED, Json(s.catalog.write_review(me.customer.id, id, r).await?)))
}

async fn delete_review(State(s): State<AppState>, me: CurrentCustomer, Path(id): Path<Uuid>) -> Result<StatusCode> {
    s.catalog.delete_review(me.customer.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_categories(State(s): State<AppState>) -> Result<Json<Vec<Category>>> {
    Ok(Json(s.catalog.categories().await?))
}

async fn list_brands(State(s): State<AppState>) -> Result<Json<Vec<Brand>>> {
    Ok(Json(s.catalog.brands().await?))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::TestApp;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    async fn product(app: &TestApp, staff: &str, name: &str, price: &str, publish: bool) -> String {
        let (status, body) = app
            .json(
                Method::POST,
                "/api/v1/admin/products",
                Some(staff),
                Some(json!({ "name": name, "price": price, "stock": 5, "publish": publish })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn only_active_products_are_listed() {
        let app = TestApp::new();
        let staff = app.sign_up_staff("admin").await;
        let live = product(&app, &staff, "Linen Shirt", "1500", true).await;
        let draft = product(&app, &staff, "Silk Saree", "9000", false).await;

        let (status, body) = app.json(Method::GET, "/api/v1/products?sort=price_asc&per_page=10", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["data"][0]["id"], live.as_str());
        assert_eq!(body["per_page"], 10);

        let (status, _) = app.json(Method::GET, &format!("/api/v1/products/{draft}"), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn price_filters_parse_from_query() {
        let app = TestApp::new();
        let staff = app.sign_up_staff("admin").await;
        product(&app, &staff, "Cotton Kurta", "800", true).await;
        product(&app, &staff, "Wool Shawl", "2500", true).await;

        let (status, body) = app.json(Method::GET, "/api/v1/products?min_price=1000&max_price=3000", None, None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["total"], 1);
        assert_eq!(body["data"][0]["name"], "Wool Shawl");
    }

    #[tokio::test]
    async fn reviews_need_a_session_and_are_unique() {
        let app = TestApp::new();
        let staff = app.sign_up_staff("admin").await;
        let id = product(&app, &staff, "Linen Shirt", "1500", true).await;
        let uri = format!("/api/v1/products/{id}/reviews");
        let review = json!({ "rating": 4, "title": "Nice", "body": "Fits well" });

        let (status, _) = app.json(Method::POST, &uri, None, Some(review.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let shopper = app.sign_up("shopper").await;
        let (status, body) = app.json(Method::POST, &uri, Some(&shopper), Some(review.clone())).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["verified_purchase"], false);
        let (status, _) = app.json(Method::POST, &uri, Some(&shopper), Some(review)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = app.json(Method::POST, &uri, Some(&shopper), Some(json!({ "rating": 9, "title": "x", "body": "y" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, listed) = app.json(Method::GET, &uri, None, None).await;
        assert_eq!(listed["total"], 1);
        let (_, detail) = app.json(Method::GET, &format!("/api/v1/products/{id}"), None, None).await;
        assert_eq!(detail["rating"]["count"], 1);
    }
}
