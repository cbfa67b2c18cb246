//! Price statistics and the structured `price_data` payload stored on variants.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::QualityTier;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

impl PriceRange {
    pub fn from_prices(prices: &[f64]) -> Option<Self> {
        let median = median(prices)?;
        let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
        let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self { min, max, median })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PriceTrend {
    Rising,
    Falling,
    Stable,
}

/// Short market summary produced alongside a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MarketInsights {
    /// Two or three sentences in Norwegian describing the market for the product.
    pub summary: String,
    pub price_trend: PriceTrend,
    pub best_value_tier: QualityTier,
    /// One sentence of buying advice in Norwegian.
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPriceSummary {
    pub source: String,
    pub avg_price: f64,
    pub total_listings: usize,
    pub merchants: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsedPriceSummary {
    pub source: String,
    pub tiers: BTreeMap<QualityTier, TierStats>,
    pub total_listings: usize,
    pub median_price: f64,
    pub price_range: PriceRange,
    pub recommendation: String,
    pub updated_at: DateTime<Utc>,
}

/// Per-condition breakdown written to `ProductVariant::price_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceData {
    pub new: Option<NewPriceSummary>,
    pub used: Option<UsedPriceSummary>,
    pub market_insights: MarketInsights,
}

/// Inclusive sane-price window for a category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBounds {
    pub min: f64,
    pub max: f64,
}

impl PriceBounds {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.min && price <= self.max
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn tier_breakdown(
    entries: impl IntoIterator<Item = (QualityTier, f64)>,
) -> BTreeMap<QualityTier, TierStats> {
    let mut out: BTreeMap<QualityTier, TierStats> = BTreeMap::new();
    for (tier, price) in entries {
        out.entry(tier)
            .and_modify(|stats| {
                stats.min = stats.min.min(price);
                stats.max = stats.max.max(price);
                stats.count += 1;
            })
            .or_insert(TierStats {
                min: price,
                max: price,
                count: 1,
            });
    }
    out
}
