//! Value Objects for the storefront

use regex::Regex;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("SKU empty")]
    SkuEmpty,
    #[error("SKU too long")]
    SkuTooLong,
    #[error("Currency mismatch: {0} vs {1}")]
    CurrencyMismatch(String, String),
    #[error("Invalid phone number")]
    InvalidPhone,
    #[error("Invalid zip/postal code")]
    InvalidZip,
    #[error("Rating must be between 1 and 5")]
    InvalidRating,
    #[error("Slug cannot be derived from {0:?}")]
    InvalidSlug(String),
}

/// SKU (Stock Keeping Unit) value object
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sku(String);

impl Sku {
    pub fn new(value: impl Into<String>) -> Result<Self, ValueError> {
        let value = value.into().trim().to_uppercase();
        if value.is_empty() { return Err(ValueError::SkuEmpty); }
        if value.len() > 50 { return Err(ValueError::SkuTooLong); }
        Ok(Self(value))
    }

    /// Random SKU for products created without one.
    pub fn generate() -> Self { Self(format!("SKU-{:08}", rand::random::<u32>())) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Sku {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl TryFrom<String> for Sku {
    type Error = ValueError;
    fn try_from(value: String) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<Sku> for String {
    fn from(sku: Sku) -> Self { sku.0 }
}

/// Money value object. Amounts are kept at two decimal places.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money { amount: Decimal, currency: String }

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> Self { Self { amount: round2(amount), currency: currency.to_string() } }
    pub fn zero(currency: &str) -> Self { Self::new(Decimal::ZERO, currency) }
    pub fn amount(&self) -> Decimal { self.amount }
    pub fn currency(&self) -> &str { &self.currency }

    pub fn add(&self, other: &Money) -> Result<Money, ValueError> {
        self.same_currency(other)?;
        Ok(Money::new(self.amount + other.amount, &self.currency))
    }

    pub fn multiply(&self, qty: u32) -> Money { Money::new(self.amount * Decimal::from(qty), &self.currency) }

    fn same_currency(&self, other: &Money) -> Result<(), ValueError> {
        if self.currency != other.currency {
            return Err(ValueError::CurrencyMismatch(self.currency.clone(), other.currency.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} {}", self.amount, self.currency) }
}

/// Half-up rounding to two decimal places, the precision every stored amount uses.
pub fn round2(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Stock or line quantity. Never wraps below zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quantity(u32);

impl Quantity {
    pub fn new(value: u32) -> Self { Self(value) }
    pub fn value(&self) -> u32 { self.0 }
    pub fn add(&self, other: u32) -> Self { Self(self.0.saturating_add(other)) }
    pub fn subtract(&self, other: u32) -> Option<Self> { self.0.checked_sub(other).map(Self) }
}

/// URL slug derived from a display name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slug(String);

impl Slug {
    pub fn from_name(name: &str) -> Result<Self, ValueError> {
        let mut slug = String::with_capacity(name.len());
        let mut pending_dash = false;
        for c in name.trim().chars() {
            if c.is_ascii_alphanumeric() {
                if pending_dash && !slug.is_empty() { slug.push('-'); }
                pending_dash = false;
                slug.push(c.to_ascii_lowercase());
            } else {
                pending_dash = true;
            }
        }
        if slug.is_empty() { return Err(ValueError::InvalidSlug(name.to_string())); }
        Ok(Self(slug))
    }

    pub fn as_str(&self) -> &str { &self.0 }
    pub fn into_inner(self) -> String { self.0 }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

fn phone_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\+?1?\d{9,15}$").expect("phone pattern compiles"))
}

fn zip_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{4,10}$").expect("zip pattern compiles"))
}

/// Phone number with country code, e.g. `+8801712345678`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(raw: &str) -> Result<Self, ValueError> {
        let compact: String = raw.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
        if !phone_pattern().is_match(&compact) { return Err(ValueError::InvalidPhone); }
        Ok(Self(compact))
    }

    pub fn as_str(&self) -> &str { &self.0 }
    pub fn into_inner(self) -> String { self.0 }
}

/// Postal code, digits only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipCode(String);

impl ZipCode {
    pub fn parse(raw: &str) -> Result<Self, ValueError> {
        let raw = raw.trim();
        if !zip_pattern().is_match(raw) { return Err(ValueError::InvalidZip); }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

/// Star rating, 1 to 5 inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub fn new(value: u8) -> Result<Self, ValueError> {
        if !(1..=5).contains(&value) { return Err(ValueError::InvalidRating); }
        Ok(Self(value))
    }
    pub fn value(&self) -> u8 { self.0 }
}

impl TryFrom<u8> for Rating {
    type Error = ValueError;
    fn try_from(value: u8) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<Rating> for u8 {
    fn from(r: Rating) -> Self { r.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sku() { let sku = Sku::new("prod-001").unwrap(); assert_eq!(sku.as_str(), "PROD-001"); }

    #[test]
    fn test_sku_rejects_blank() { assert_eq!(Sku::new("   "), Err(ValueError::SkuEmpty)); }

    #[test]
    fn test_money_add() {
        let a = Money::new(Decimal::new(100, 0), "BDT");
        let b = Money::new(Decimal::new(50, 0), "BDT");
        assert_eq!(a.add(&b).unwrap().amount(), Decimal::new(150, 0));
    }

    #[test]
    fn test_money_currency_mismatch() {
        let a = Money::new(Decimal::ONE, "BDT");
        let b = Money::new(Decimal::ONE, "USD");
        assert!(matches!(a.add(&b), Err(ValueError::CurrencyMismatch(_, _))));
    }

    #[test]
    fn test_money_rounds_half_up() {
        assert_eq!(Money::new(Decimal::new(10005, 3), "BDT").amount(), Decimal::new(1001, 2));
    }

    #[test]
    fn test_quantity_subtract_never_underflows() {
        assert_eq!(Quantity::new(3).subtract(4), None);
        assert_eq!(Quantity::new(3).subtract(3), Some(Quantity::new(0)));
        assert_eq!(Quantity::new(u32::MAX).add(1).value(), u32::MAX);
    }

    #[test]
    fn test_slug() {
        assert_eq!(Slug::from_name("Men's Clothing").unwrap().as_str(), "men-s-clothing");
        assert_eq!(Slug::from_name("  Kids -- Clothing ").unwrap().as_str(), "kids-clothing");
        assert!(Slug::from_name("!!!").is_err());
    }

    #[test]
    fn test_phone() {
        assert_eq!(PhoneNumber::parse("+880 1712-345678").unwrap().as_str(), "+8801712345678");
        assert!(PhoneNumber::parse("12345").is_err());
        assert!(PhoneNumber::parse("+88017abc45678").is_err());
    }

    #[test]
    fn test_zip() {
        assert!(ZipCode::parse("1207").is_ok());
        assert!(ZipCode::parse("12").is_err());
        assert!(ZipCode::parse("12A7").is_err());
    }

    #[test]
    fn test_rating_bounds() {
        assert!(Rating::new(0).is_err());
        assert!(Rating::new(6).is_err());
        assert_eq!(Rating::new(5).unwrap().value(), 5);
    }
}
