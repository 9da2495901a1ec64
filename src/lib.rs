//! OpenSASE Storefront
//!
//! Self-hosted fashion storefront: catalog, carts, checkout, orders,
//! customer accounts, reviews and wishlists, paid through SSLCommerz.
//!
//! ## Features
//! - Product catalog with size/colour variants and per-variant stock
//! - Anonymous and customer carts, merged on login
//! - Atomic, idempotent checkout that reserves stock
//! - Order status state machine with optimistic concurrency
//! - Signature-verified, replay-safe payment callbacks
//! - Accounts, address book, reviews, wishlist

pub mod config;
pub mod domain;
pub mod http;
pub mod payment;
pub mod publisher;
pub mod seed;
pub mod services;
pub mod store;

use rust_decimal::Decimal;
use thiserror::Error;

use domain::aggregates::{AccountError, CartError, OrderError, ProductError};
use domain::value_objects::ValueError;
use payment::PaymentError;
use store::StoreError;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum StorefrontError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Cart(#[from] CartError),

    #[error(transparent)]
    Product(#[from] ProductError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("{0}")]
    Validation(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid username/email or password")]
    InvalidCredentials,

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("Your cart is empty")]
    EmptyCart,

    #[error("Only {available} left in stock for {sku}")]
    OutOfStock { sku: String, available: u32 },

    #[error("Prices changed: expected {expected}, order total is now {actual}")]
    PriceChanged { expected: Decimal, actual: Decimal },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StorefrontError>;
