//! Sign-up, sessions, profile, password flows, address book and wishlist.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::auth::{CartSession, ClientIp, CurrentCustomer};
use super::{AppState, ValidJson};
use crate::domain::aggregates::{Address, Customer, Preferences};
use crate::services::accounts::{AddressInput, ProfileUpdate, ProfileView, Registration, SignedIn};
use crate::services::catalog::WishlistItem;
use crate::Result;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/password/forgot", post(forgot_password))
        .route("/auth/password/reset", post(reset_password))
        .route("/auth/email/verify", post(request_email_verification))
        .route("/auth/email/confirm", post(confirm_email))
        .route("/account", delete(delete_account))
        .route("/account/profile", get(get_profile).put(update_profile))
        .route("/account/password", post(change_password))
        .route("/account/settings", get(get_settings).put(update_settings))
        .route("/account/phone/verify", post(verify_phone))
        .route("/account/addresses", get(list_addresses).post(add_address))
        .route("/account/addresses/:id", get(get_address).put(update_address).delete(delete_address))
        .route("/account/addresses/:id/default", post(set_default_address))
        .route("/account/wishlist", get(wishlist).post(add_to_wishlist))
        .route("/account/wishlist/:product_id", delete(remove_from_wishlist))
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub customer: Customer,
}

impl From<SignedIn> for SessionResponse {
    fn from(s: SignedIn) -> Self { Self { token: s.token, customer: s.customer } }
}

/// Folds the anonymous cart into the new session's cart. Failures only cost the merge.
async fn merge_cart(s: &AppState, cart: CartSession, customer_id: Uuid) {
    if let CartSession(Some(key)) = cart {
        if let Err(e) = s.checkout.merge_anonymous_cart(&key, customer_id).await {
            tracing::warn!(%customer_id, error = %e, "cart merge failed");
        }
    }
}

async fn register(
    State(s): State<AppState>,
    ClientIp(ip): ClientIp,
    cart: CartSession,
    ValidJson(r): ValidJson<Registration>,
) -> Result<(StatusCode, Json<SessionResponse>)> {
    let signed_in = s.accounts.register(r, ip).await?;
    merge_cart(&s, cart, signed_in.customer.id).await;
    Ok((StatusCode::CREATED, Json(signed_in.into())))
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    /// Username or email.
    #[validate(length(min = 1))]
    pub login: String,
    #[validate(length(min = 1))]
    pub password: String,
}

async fn login(
    State(s): State<AppState>,
    ClientIp(ip): ClientIp,
    cart: CartSession,
    ValidJson(r): ValidJson<LoginRequest>,
) -> Result<Json<SessionResponse>> {
    let signed_in = s.accounts.login(&r.login, &r.password, ip).await?;
    merge_cart(&s, cart, signed_in.customer.id).await;
    Ok(Json(signed_in.into()))
}

async fn logout(State(s): State<AppState>, me: CurrentCustomer) -> Result<StatusCode> {
    s.accounts.logout(&me.token_hash).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Validate)]
pub struct ForgotPasswordRequest {
    #[validate(email)]
    pub email: String,
}

async fn forgot_password(State(s): State<AppState>, ValidJson(r): ValidJson<ForgotPasswordRequest>) -> Result<StatusCode> {
    s.accounts.forgot_password(&r.email).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1))]
    pub token: String,
    pub password: String,
    pub password_confirm: String,
}

async fn reset_password(State(s): State<AppState>, ValidJson(r): ValidJson<ResetPasswordRequest>) -> Result<StatusCode> {
    s.accounts.reset_password(&r.token, &r.password, &r.password_confirm).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn request_email_verification(State(s): State<AppState>, me: CurrentCustomer) -> Result<StatusCode> {
    s.accounts.request_email_verification(me.customer.id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

async fn confirm_email(State(s): State<AppState>, Json(r): Json<TokenRequest>) -> Result<Json<Customer>> {
    Ok(Json(s.accounts.confirm_email(&r.token).await?))
}

async fn get_profile(State(s): State<AppState>, me: CurrentCustomer) -> Result<Json<ProfileView>> {
    Ok(Json(s.accounts.profile(me.customer.id).await?))
}

async fn update_profile(State(s): State<AppState>, me: CurrentCustomer, ValidJson(r): ValidJson<ProfileUpdate>) -> Result<Json<Customer>> {
    Ok(Json(s.accounts.update_profile(me.customer.id, r).await?))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
    pub new_password_confirm: String,
}

async fn change_password(State(s): State<AppState>, me: CurrentCustomer, Json(r): Json<ChangePasswordRequest>) -> Result<StatusCode> {
    s.accounts
        .change_password(me.customer.id, &me.token_hash, &r.current_password, &r.new_password, &r.new_password_confirm)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_settings(State(s): State<AppState>, me: CurrentCustomer) -> Result<Json<Preferences>> {
    Ok(Json(s.accounts.settings(me.customer.id).await?))
}

async fn update_settings(State(s): State<AppState>, me: CurrentCustomer, Json(r): Json<Preferences>) -> Result<Json<Preferences>> {
    Ok(Json(s.accounts.update_settings(me.customer.id, r).await?))
}

async fn verify_phone(State(s): State<AppState>, me: CurrentCustomer) -> Result<Json<Customer>> {
    Ok(Json(s.accounts.verify_phone(me.customer.id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DeleteAccountRequest {
    pub password: String,
}

async fn delete_account(State(s): State<AppState>, me: CurrentCustomer, Json(r): Json<DeleteAccountRequest>) -> Result<StatusCode> {
    s.accounts.delete_account(me.customer.id, &r.password).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- address book ---

async fn list_addresses(State(s): State<AppState>, me: CurrentCustomer) -> Result<Json<Vec<Address>>> {
    Ok(Json(s.accounts.addresses(me.customer.id).await?))
}

async fn get_address(State(s): State<AppState>, me: CurrentCustomer, Path(id): Path<Uuid>) -> Result<Json<Address>> {
    Ok(Json(s.accounts.address(me.customer.id, id).await?))
}

async fn add_address(State(s): State<AppState>, me: CurrentCustomer, ValidJson(r): ValidJson<AddressInput>) -> Result<(StatusCode, Json<Address>)> {
    Ok((StatusCode::CREATED, Json(s.accounts.add_address(me.customer.id, r).await?)))
}

async fn update_address(
    State(s): State<AppState>,
    me: CurrentCustomer,
    Path(id): Path<Uuid>,
    ValidJson(r): ValidJson<AddressInput>,
) -> Result<Json<Address>> {
    Ok(Json(s.accounts.update_address(me.customer.id, id, r).await?))
}

async fn delete_address(State(s): State<AppState>, me: CurrentCustomer, Path(id): Path<Uuid>) -> Result<StatusCode> {
    s.accounts.delete_address(me.customer.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_default_address(State(s): State<AppState>, me: CurrentCustomer, Path(id): Path<Uuid>) -> Result<Json<Address>> {
    Ok(Json(s.accounts.set_default_address(me.customer.id, id).await?))
}

// --- wishlist ---

async fn wishlist(State(s): State<AppState>, me: CurrentCustomer) -> Result<Json<Vec<WishlistItem>>> {
    Ok(Json(s.catalog.wishlist(me.customer.id).await?))
}

#[derive(Debug, Deserialize)]
pub struct WishlistRequest {
    pub product_id: Uuid,
}

async fn add_to_wishlist(State(s): State<AppState>, me: CurrentCustomer, Json(r): Json<WishlistRequest>) -> Result<StatusCode> {
    let added = s.catalog.add_to_wishlist(me.customer.id, r.product_id).await?;
    Ok(if added { StatusCode::CREATED } else { StatusCode::OK })
}

async fn remove_from_wishlist(State(s): State<AppState>, me: CurrentCustomer, Path(product_id): Path<Uuid>) -> Result<StatusCode> {
    s.catalog.remove_from_wishlist(me.customer.id, product_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
