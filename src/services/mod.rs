//! Application services: the operations the HTTP layer exposes, each one
//! loading aggregates from the store, applying domain rules, committing and
//! publishing the resulting events.

pub mod accounts;
pub mod catalog;
pub mod checkout;
pub mod orders;

use validator::ValidationError;

use crate::domain::value_objects::{PhoneNumber, ZipCode};

pub use accounts::AccountService;
pub use catalog::CatalogService;
pub use checkout::CheckoutService;
pub use orders::OrderService;

/// Blank means "no phone number".
pub(crate) fn validate_phone(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() || PhoneNumber::parse(value).is_ok() {
        return Ok(());
    }
    let mut err = ValidationError::new("phone");
    err.message = Some("Phone number must be entered in the format: '+999999999'. Up to 15 digits allowed.".into());
    Err(err)
}

pub(crate) fn validate_zip(value: &str) -> Result<(), ValidationError> {
    if ZipCode::parse(value).is_ok() {
        return Ok(());
    }
    let mut err = ValidationError::new("zip_code");
    err.message = Some("Enter a valid zip/postal code.".into());
    Err(err)
}

/// Normalised phone number, `None` when blank.
pub(crate) fn normalize_phone(raw: Option<&str>) -> crate::Result<Option<String>> {
    match raw.map(str::trim).filter(|p| !p.is_empty()) {
        Some(phone) => Ok(Some(PhoneNumber::parse(phone)?.into_inner())),
        None => Ok(None),
    }
}
