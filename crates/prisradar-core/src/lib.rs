//! Core domain model for prisradar: catalog entries, scraped and matched
//! listings, the daily scrape budget and the AI job queue.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod jobs;
pub mod pricing;

pub use jobs::{
    cache_key_for, AiJob, AlertEmail, AlertEmailPayload, Attribute, AttributeSet, CacheEntry,
    ExtractAttributesPayload, JobKind, JobResult, JobStatus, JobTask, NormalizeOfferPayload,
    NormalizedOffer, OfferCandidate, OfferMatch, ProductAttribute, CACHE_TTL_HOURS,
};
pub use pricing::{
    mean, median, tier_breakdown, MarketInsights, NewPriceSummary, PriceBounds, PriceData,
    PriceRange, PriceTrend, TierStats, UsedPriceSummary,
};

pub const CRATE_NAME: &str = "prisradar-core";

/// Catalog entry. Created and owned externally; the pipeline only touches
/// `last_scraped_at` and the tuning pass adjusts the scheduling fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub priority_score: i32,
    #[serde(default)]
    pub scrape_frequency_hours: Option<f64>,
    #[serde(default)]
    pub last_scraped_at: Option<DateTime<Utc>>,
}

impl Product {
    pub fn frequency_hours(&self, default_hours: f64) -> f64 {
        self.scrape_frequency_hours.unwrap_or(default_hours)
    }

    /// Whether the minimum re-scrape interval has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, default_hours: f64) -> bool {
        let Some(last) = self.last_scraped_at else {
            return true;
        };
        let elapsed_hours = (now - last).num_seconds() as f64 / 3600.0;
        elapsed_hours >= self.frequency_hours(default_hours)
    }
}

/// A sellable configuration of a product. Identity and spec fields are owned
/// externally, the price fields are derived by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub id: Uuid,
    pub product_id: Uuid,
    #[serde(default)]
    pub storage_gb: Option<i32>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub price_new: Option<f64>,
    #[serde(default)]
    pub price_used: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub price_data: Option<PriceData>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProductVariant {
    pub fn spec(&self) -> VariantSpec {
        VariantSpec {
            id: self.id,
            storage_gb: self.storage_gb,
            color: self.color.clone(),
            model: self.model.clone(),
        }
    }
}

/// The identifying attributes of a variant, as handed to the matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub id: Uuid,
    pub storage_gb: Option<i32>,
    pub color: Option<String>,
    pub model: Option<String>,
}

/// Derived fields written back to a variant after a pipeline pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantPriceUpdate {
    pub price_new: Option<f64>,
    pub price_used: Option<f64>,
    pub confidence: f64,
    pub price_data: PriceData,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    New,
    Used,
}

impl Condition {
    pub fn as_str(self) -> &'static str {
        match self {
            Condition::New => "new",
            Condition::Used => "used",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Condition {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Condition::New),
            "used" => Ok(Condition::Used),
            other => Err(ParseEnumError::new("condition", other)),
        }
    }
}

/// Where a page comes from. Marketplace listings are second-hand, retailer
/// listings are new stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Marketplace,
    Retailer,
}

impl SourceKind {
    pub fn condition(self) -> Condition {
        match self {
            SourceKind::Marketplace => Condition::Used,
            SourceKind::Retailer => Condition::New,
        }
    }
}

/// Coarse condition bucket for a listing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl QualityTier {
    pub const ALL: [QualityTier; 4] = [
        QualityTier::Excellent,
        QualityTier::Good,
        QualityTier::Acceptable,
        QualityTier::Poor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Acceptable => "acceptable",
            QualityTier::Poor => "poor",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QualityTier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("quality tier", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value:?}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Raw extraction output. Transient: only matched, normalized listings are
/// ever persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedListing {
    pub merchant_name: String,
    pub price: f64,
    pub condition: Condition,
    pub url: String,
    pub title: String,
}

/// A matched, scored listing row. Rows written for one variant in one pass
/// share `listing_group_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantListing {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub merchant_name: String,
    pub price: f64,
    pub condition: Condition,
    pub url: String,
    pub confidence: f64,
    pub price_tier: QualityTier,
    pub listing_group_id: Uuid,
    pub market_insight: Option<String>,
    pub is_valid: bool,
    pub scraped_at: DateTime<Utc>,
}

/// Retailer page registered for a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantUrl {
    pub id: Uuid,
    pub category: String,
    pub merchant_name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub last_scraped_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

/// One row per calendar day. `used + remaining == total` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub date: NaiveDate,
    pub total: i32,
    pub used: i32,
    pub remaining: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient scrape budget: requested {requested}, remaining {remaining}")]
pub struct InsufficientBudget {
    pub requested: i32,
    pub remaining: i32,
}

impl Budget {
    pub fn fresh(date: NaiveDate, total: i32) -> Self {
        let total = total.max(0);
        Self {
            date,
            total,
            used: 0,
            remaining: total,
        }
    }

    pub fn can_scrape(&self) -> bool {
        self.remaining > 0
    }

    pub fn is_consistent(&self) -> bool {
        self.remaining >= 0 && self.used >= 0 && self.used + self.remaining == self.total
    }

    /// Returns the budget after spending `amount`, or refuses when it does not fit.
    pub fn allocate(&self, amount: i32) -> Result<Budget, InsufficientBudget> {
        if amount > self.remaining {
            return Err(InsufficientBudget {
                requested: amount,
                remaining: self.remaining,
            });
        }
        Ok(Budget {
            used: self.used + amount,
            remaining: self.remaining - amount,
            ..*self
        })
    }
}
