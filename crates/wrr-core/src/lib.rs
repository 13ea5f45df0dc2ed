//! Core domain model for WRR: works, price history, circles and creator credits.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "wrr-core";

/// Listing price as currently published. Signed so corrupted values survive a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkPrice {
    pub current: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SalesStatus {
    pub is_sale: bool,
    pub is_sold_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rating {
    pub stars: f64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatorRole {
    Voice,
    Illustration,
    Scenario,
    Music,
    Other,
}

impl CreatorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Illustration => "illustration",
            Self::Scenario => "scenario",
            Self::Music => "music",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for CreatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One credited contributor of a work with every role they hold on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorCredit {
    pub creator_id: String,
    pub name: String,
    pub roles: Vec<CreatorRole>,
}

/// Canonical record for one marketplace listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub product_id: String,
    pub title: String,
    pub circle_id: String,
    pub circle_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circle_name_en: Option<String>,
    pub price: WorkPrice,
    /// Pre-discount list price; only meaningful while a discount is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_price: Option<i64>,
    /// Fraction in `[0, 1]` when valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_rate: Option<f64>,
    #[serde(default)]
    pub sales_status: SalesStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<Rating>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub creators: Vec<CreatorCredit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Work {
    pub fn stars(&self) -> f64 {
        self.rating.map(|r| r.stars).unwrap_or(0.0)
    }

    pub fn has_active_discount(&self) -> bool {
        self.discount_rate.is_some_and(|rate| rate > 0.0)
    }

    /// Official price when it is set to a usable (positive) value.
    pub fn positive_official_price(&self) -> Option<i64> {
        self.official_price.filter(|price| *price > 0)
    }

    /// Sale price implied by `official_price` and `discount_rate`, if both are active.
    pub fn expected_discount_price(&self) -> Option<i64> {
        let rate = self.discount_rate.filter(|rate| *rate > 0.0)?;
        let official = self.positive_official_price()?;
        Some(discounted_price(official, rate))
    }
}

/// `round(official × (1 − rate))`.
pub fn discounted_price(official: i64, rate: f64) -> i64 {
    (official as f64 * (1.0 - rate)).round() as i64
}

pub fn is_valid_discount_rate(rate: f64) -> bool {
    (0.0..=1.0).contains(&rate)
}

/// One day of a work's price series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub date: NaiveDate,
    pub regular_price: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_price: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PriceHistoryEntry {
    pub fn new(date: NaiveDate, regular_price: i64, discount_price: Option<i64>) -> Self {
        Self {
            date,
            regular_price,
            discount_price,
            updated_at: None,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.regular_price >= 0
            && self
                .discount_price
                .map_or(true, |discount| discount <= self.regular_price)
    }
}

/// Publisher aggregate with its member works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    pub circle_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_en: Option<String>,
    #[serde(default)]
    pub work_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorWorkRelation {
    pub work_id: String,
    pub roles: Vec<CreatorRole>,
    pub circle_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Creator with role-tagged relations keyed by work id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    pub creator_id: String,
    pub name: String,
    #[serde(default)]
    pub works: BTreeMap<String, CreatorWorkRelation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
