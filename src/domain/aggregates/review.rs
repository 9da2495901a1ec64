//! Product reviews and wishlist entries

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::value_objects::Rating;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub product_id: Uuid,
    pub customer_id: Uuid,
    pub rating: Rating,
    pub title: String,
    pub body: String,
    pub verified_purchase: bool,
    pub created_at: DateTime<Utc>,
}

impl Review {
    pub fn write(product_id: Uuid, customer_id: Uuid, rating: Rating, title: impl Into<String>, body: impl Into<String>, verified_purchase: bool) -> Self {
        Self {
            id: Uuid::now_v7(), product_id, customer_id, rating, title: title.into().trim().to_string(),
            body: body.into().trim().to_string(), verified_purchase, created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub count: u32,
    /// Mean rating to one decimal place; `None` without reviews.
    pub average: Option<Decimal>,
}

impl RatingSummary {
    pub fn from_ratings(ratings: impl IntoIterator<Item = u8>) -> Self {
        let (count, sum) = ratings.into_iter().fold((0u32, 0u32), |(n, s), r| (n + 1, s + u32::from(r)));
        if count == 0 { return Self::default(); }
        let average = (Decimal::from(sum) / Decimal::from(count)).round_dp(1);
        Self { count, average: Some(average) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WishlistEntry {
    pub customer_id: Uuid,
    pub product_id: Uuid,
    pub added_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_rounds_to_one_place() {
        let s = RatingSummary::from_ratings([5, 4, 4]);
        assert_eq!(s.count, 3);
        assert_eq!(s.average, Some(Decimal::new(43, 1)));
    }

    #[test]
    fn empty_summary() {
        assert_eq!(RatingSummary::from_ratings([]), RatingSummary::default());
    }
}
