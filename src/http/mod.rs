//! JSON API over the storefront services.
//!
//! Everything lives under `/api/v1` except `/health`. Handlers stay thin:
//! extract, call one service method, wrap the result.

pub mod account;
pub mod admin;
pub mod auth;
pub mod cart;
pub mod catalog;
pub mod error;
pub mod orders;
pub mod payments;

use axum::extract::{FromRequest, Request, State};
use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use validator::{Validate, ValidationErrors};

use crate::config::AppConfig;
use crate::payment::{PaymentGateway, PaymentReconciler, SessionUrls};
use crate::publisher::EventPublisher;
use crate::services::{AccountService, CatalogService, CheckoutService, OrderService};
use crate::store::{Page, PageRequest, StorefrontStore};
use crate::StorefrontError;

#[derive(Clone)]
pub struct AppState {
    pub accounts: AccountService,
    pub catalog: CatalogService,
    pub checkout: CheckoutService,
    pub orders: OrderService,
    pub reconciler: PaymentReconciler,
    pub events: EventPublisher,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn StorefrontStore>, gateway: Arc<dyn PaymentGateway>, events: EventPublisher) -> Self {
        Self {
            accounts: AccountService::new(store.clone(), events.clone(), config.session_ttl),
            catalog: CatalogService::new(store.clone()),
            checkout: CheckoutService::new(store.clone(), events.clone(), config.pricing.clone()),
            orders: OrderService::new(
                store.clone(),
                gateway.clone(),
                events.clone(),
                SessionUrls::for_site(&config.site_url),
                config.payment_window,
            ),
            reconciler: PaymentReconciler::new(store, gateway, events.clone()),
            events,
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(catalog::routes())
        .merge(account::routes())
        .merge(cart::routes())
        .merge(orders::routes())
        .merge(payments::routes())
        .merge(admin::routes());

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors_layer(&state.config.cors_origins)))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(allowed)).allow_methods(Any).allow_headers(Any)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "opensase-storefront",
        "events": if state.events.is_connected() { "nats" } else { "log" },
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl PageParams {
    pub fn request(&self) -> PageRequest { PageRequest::new(self.page, self.per_page) }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> PaginatedResponse<T> {
    pub fn new(page: Page<T>, request: PageRequest) -> Self {
        Self { data: page.items, total: page.total, page: request.page, per_page: request.per_page }
    }
}

/// JSON body that must also pass its `validator` rules.
pub struct ValidJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = StorefrontError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| StorefrontError::Validation(rejection.body_text()))?;
        value.validate().map_err(|e| StorefrontError::Validation(validation_message(&e)))?;
        Ok(Self(value))
    }
}

/// Flattens field errors into `field: message` pairs.
fn validation_message(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{field}: {message}"),
                None => format!("{field}: invalid {}", e.code),
            })
        })
        .collect();
    if messages.is_empty() {
        return errors.to_string();
    }
    messages.sort();
    messages.join("; ")
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Router harness over the memory store and the fake gateway.

    use super::*;
    use crate::payment::fake::FakeGateway;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::response::Response;
    use tower::ServiceExt;

    pub struct TestApp {
        pub router: Router,
        pub store: Arc<MemoryStore>,
        pub gateway: Arc<FakeGateway>,
        pub state: AppState,
    }

    impl TestApp {
        pub fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let gateway = Arc::new(FakeGateway::new());
            let state = AppState::new(AppConfig::local(), store.clone(), gateway.clone(), EventPublisher::disabled());
            Self { router: build_router(state.clone()), store, gateway, state }
        }

        pub async fn send(&self, request: Request<Body>) -> Response {
            self.router.clone().oneshot(request).await.unwrap()
        }

        pub async fn json(&self, method: Method, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {token}"));
            }
            let request = match body {
                Some(body) => builder.header("content-type", "application/json").body(Body::from(body.to_string())).unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let response = self.send(request).await;
            let status = response.status();
            (status, read_json(response).await)
        }

        /// Registers a shopper and returns the bearer token.
        pub async fn sign_up(&self, username: &str) -> String {
            let (status, body) = self
                .json(
                    Method::POST,
                    "/api/v1/auth/register",
                    None,
                    Some(serde_json::json!({
                        "username": username,
                        "email": format!("{username}@example.com"),
                        "password": "hunter2pass",
                        "password_confirm": "hunter2pass",
                    })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{body}");
            body["token"].as_str().unwrap().to_string()
        }

        /// Registers a staff member and returns the bearer token.
        pub async fn sign_up_staff(&self, username: &str) -> String {
            let token = self.sign_up(username).await;
            let mut customer = self.state.accounts.authenticate(&token).await.unwrap().customer;
            customer.is_staff = true;
            crate::store::StorefrontStore::update_customer(self.store.as_ref(), &customer).await.unwrap();
            token
        }
    }

    pub async fn read_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        if bytes.is_empty() {
            return serde_json::Value::Null;
        }
        serde_json::from_slice(&bytes).unwrap()
    }
}
