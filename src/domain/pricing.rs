//! Order totals

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::round2;

/// Shipping and tax rules applied to a priced basket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub currency: String,
    pub shipping_flat_fee: Decimal,
    /// Subtotal at or above which shipping is free. `None` disables free shipping.
    pub free_shipping_threshold: Option<Decimal>,
    /// Fraction of the subtotal, e.g. `0.05` for 5%.
    pub tax_rate: Decimal,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            currency: "BDT".to_string(),
            shipping_flat_fee: Decimal::new(60, 0),
            free_shipping_threshold: Some(Decimal::new(2000, 0)),
            tax_rate: Decimal::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub currency: String,
    pub subtotal: Decimal,
    pub shipping: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

impl OrderTotals {
    pub fn zero(currency: &str) -> Self {
        Self {
            currency: currency.to_string(),
            subtotal: Decimal::ZERO,
            shipping: Decimal::ZERO,
            tax: Decimal::ZERO,
            discount: Decimal::ZERO,
            total: Decimal::ZERO,
        }
    }
}

impl PricingPolicy {
    /// Totals for lines given as `(unit_price, quantity)`.
    pub fn totals<I>(&self, lines: I) -> OrderTotals
    where
        I: IntoIterator<Item = (Decimal, u32)>,
    {
        let subtotal = round2(lines.into_iter().map(|(unit, qty)| round2(unit) * Decimal::from(qty)).sum());
        if subtotal.is_zero() {
            return OrderTotals::zero(&self.currency);
        }
        let shipping = match self.free_shipping_threshold {
            Some(threshold) if subtotal >= threshold => Decimal::ZERO,
            _ => round2(self.shipping_flat_fee),
        };
        let tax = round2(subtotal * self.tax_rate);
        let discount = Decimal::ZERO;
        OrderTotals {
            currency: self.currency.clone(),
            subtotal,
            shipping,
            tax,
            discount,
            total: round2(subtotal + shipping + tax - discount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PricingPolicy {
        PricingPolicy {
            currency: "BDT".into(),
            shipping_flat_fee: Decimal::new(60, 0),
            free_shipping_threshold: Some(Decimal::new(2000, 0)),
            tax_rate: Decimal::new(5, 2),
        }
    }

    #[test]
    fn empty_basket_is_free() {
        let totals = policy().totals(Vec::new());
        assert_eq!(totals.total, Decimal::ZERO);
        assert_eq!(totals.shipping, Decimal::ZERO);
    }

    #[test]
    fn flat_shipping_below_threshold() {
        let totals = policy().totals([(Decimal::new(1999, 2), 2)]);
        assert_eq!(totals.subtotal, Decimal::new(3998, 2));
        assert_eq!(totals.shipping, Decimal::new(60, 0));
        // 5% of 39.98 = 1.999 -> 2.00
        assert_eq!(totals.tax, Decimal::new(200, 2));
        assert_eq!(totals.total, Decimal::new(10198, 2));
    }

    #[test]
    fn free_shipping_at_threshold() {
        let totals = policy().totals([(Decimal::new(1000, 0), 2)]);
        assert_eq!(totals.shipping, Decimal::ZERO);
        assert_eq!(totals.total, Decimal::new(2100, 0));
    }
}
