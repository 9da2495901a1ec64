//! Cart endpoints. Anonymous carts are keyed by `X-Cart-Session`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::auth::CartKey;
use super::AppState;
use crate::services::checkout::CartView;
use crate::Result;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cart", get(get_cart).delete(clear_cart))
        .route("/cart/items", post(add_item))
        .route("/cart/items/:item_id", put(update_item).delete(remove_item))
}

fn one() -> u32 { 1 }

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[serde(default = "one")]
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: u32,
}

async fn get_cart(State(s): State<AppState>, CartKey(owner): CartKey) -> Result<Json<CartView>> {
    Ok(Json(s.checkout.cart(&owner).await?))
}

async fn add_item(State(s): State<AppState>, CartKey(owner): CartKey, Json(r): Json<AddItemRequest>) -> Result<(StatusCode, Json<CartView>)> {
    let cart = s.checkout.add_item(&owner, r.product_id, r.variant_id, r.quantity).await?;
    Ok((StatusCode::CREATED, Json(cart)))
}

async fn update_item(
    State(s): State<AppState>,
    CartKey(owner): CartKey,
    Path(item_id): Path<Uuid>,
    Json(r): Json<UpdateItemRequest>,
) -> Result<Json<CartView>> {
    Ok(Json(s.checkout.update_item(&owner, item_id, r.quantity).await?))
}

async fn remove_item(State(s): State<AppState>, CartKey(owner): CartKey, Path(item_id): Path<Uuid>) -> Result<Json<CartView>> {
    Ok(Json(s.checkout.remove_item(&owner, item_id).await?))
}

async fn clear_cart(State(s): State<AppState>, CartKey(owner): CartKey) -> Result<StatusCode> {
    s.checkout.clear(&owner).await?;
    Ok(StatusCode::NO_CONTENT)
}
