//! Checkout and the shopper's own orders.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::auth::{CurrentCustomer, IdempotencyKey};
use super::{AppState, PaginatedResponse, ValidJson};
use crate::domain::aggregates::{Order, OrderStatus};
use crate::services::checkout::CheckoutInput;
use crate::services::orders::PaymentRedirect;
use crate::store::{OrderQuery, PageRequest};
use crate::Result;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(checkout))
        .route("/orders", get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/payment", post(start_payment))
}

#[derive(Debug, Default, Deserialize)]
pub struct OrderParams {
    pub status: Option<OrderStatus>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl OrderParams {
    pub fn into_query(self) -> OrderQuery {
        OrderQuery { customer_id: None, status: self.status, page: PageRequest::new(self.page, self.per_page) }
    }
}

/// 201 for a new order, 200 when the idempotency key replays an earlier one.
async fn checkout(
    State(s): State<AppState>,
    me: CurrentCustomer,
    IdempotencyKey(key): IdempotencyKey,
    ValidJson(r): ValidJson<CheckoutInput>,
) -> Result<(StatusCode, Json<Order>)> {
    let placed = s.checkout.place_order(&me.customer, r, key).await?;
    let status = if placed.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(placed.order)))
}

async fn list_orders(State(s): State<AppState>, me: CurrentCustomer, Query(p): Query<OrderParams>) -> Result<Json<PaginatedResponse<Order>>> {
    let query = p.into_query();
    let page = query.page;
    Ok(Json(PaginatedResponse::new(s.orders.list_for_customer(me.customer.id, query).await?, page)))
}

async fn get_order(State(s): State<AppState>, me: CurrentCustomer, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(s.orders.get_for_customer(me.customer.id, id).await?))
}

async fn cancel_order(State(s): State<AppState>, me: CurrentCustomer, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(s.orders.cancel_by_customer(me.customer.id, id).await?))
}

async fn start_payment(State(s): State<AppState>, me: CurrentCustomer, Path(id): Path<Uuid>) -> Result<Json<PaymentRedirect>> {
    Ok(Json(s.orders.initiate_payment(me.customer.id, id).await?))
}
