//! HTTP status mapping for [`StorefrontError`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::domain::aggregates::{AccountError, CartError, OrderError, ProductError};
use crate::domain::value_objects::ValueError;
use crate::payment::PaymentError;
use crate::store::StoreError;
use crate::StorefrontError;

impl StorefrontError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Store(e) => match e {
                StoreError::NotFound => StatusCode::NOT_FOUND,
                StoreError::Conflict | StoreError::Duplicate(_) | StoreError::InsufficientStock { .. } => StatusCode::CONFLICT,
                StoreError::Corrupt(_) | StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Payment(e) => match e {
                PaymentError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                PaymentError::Declined(_) | PaymentError::Malformed(_) | PaymentError::Transport(_) => StatusCode::BAD_GATEWAY,
            },
            Self::Order(e) => match e {
                OrderError::AmountMismatch { .. } | OrderError::NoItems => StatusCode::UNPROCESSABLE_ENTITY,
                OrderError::TotalsMismatch => StatusCode::INTERNAL_SERVER_ERROR,
                OrderError::InvalidTransition { .. }
                | OrderError::AlreadyPaid
                | OrderError::RefundRequired
                | OrderError::PaymentWindowExpired => StatusCode::CONFLICT,
            },
            Self::Cart(e) => match e {
                CartError::ItemNotFound => StatusCode::NOT_FOUND,
                CartError::InvalidQuantity => StatusCode::BAD_REQUEST,
                CartError::CurrencyMismatch => StatusCode::CONFLICT,
                CartError::Empty => StatusCode::UNPROCESSABLE_ENTITY,
            },
            Self::Product(e) => match e {
                ProductError::MissingName | ProductError::InvalidPrice | ProductError::VariantRequired => StatusCode::BAD_REQUEST,
                ProductError::VariantNotFound => StatusCode::NOT_FOUND,
                ProductError::DuplicateVariant => StatusCode::CONFLICT,
                ProductError::Unavailable | ProductError::InsufficientInventory => StatusCode::UNPROCESSABLE_ENTITY,
            },
            Self::Account(e) => match e {
                AccountError::WeakPassword(_) | AccountError::InvalidUsername => StatusCode::BAD_REQUEST,
                AccountError::AlreadyVerified(_) => StatusCode::CONFLICT,
                AccountError::PhoneMissing => StatusCode::UNPROCESSABLE_ENTITY,
            },
            Self::Value(ValueError::CurrencyMismatch(..)) => StatusCode::CONFLICT,
            Self::Value(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::EmptyCart | Self::OutOfStock { .. } | Self::PriceChanged { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StorefrontError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
            "Internal server error".to_string()
        } else {
            if status.is_server_error() {
                error!(error = %self, "upstream failure");
            }
            self.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn business_rules_map_to_unprocessable() {
        assert_eq!(StorefrontError::EmptyCart.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        let changed = StorefrontError::PriceChanged { expected: Decimal::ONE, actual: Decimal::TWO };
        assert_eq!(changed.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn state_conflicts_map_to_409() {
        assert_eq!(StorefrontError::from(OrderError::AlreadyPaid).status_code(), StatusCode::CONFLICT);
        assert_eq!(StorefrontError::from(StoreError::Conflict).status_code(), StatusCode::CONFLICT);
        assert_eq!(StorefrontError::from(StoreError::NotFound).status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn gateway_failures_map_to_502() {
        let declined = StorefrontError::from(PaymentError::Declined("FAILED".into()));
        assert_eq!(declined.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(StorefrontError::from(PaymentError::NotConfigured).status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn internal_details_are_hidden() {
        let response = StorefrontError::Internal("pool exhausted".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = super::super::test_support::read_json(response).await;
        assert_eq!(body["error"], "Internal server error");
    }
}
