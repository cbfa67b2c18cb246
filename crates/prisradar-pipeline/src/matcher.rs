//! Listing-to-variant matching through the oracle, with the answer validated
//! against the scraped input before anything downstream trusts it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use prisradar_core::{
    tier_breakdown, Condition, MarketInsights, PriceRange, QualityTier, ScrapedListing, TierStats,
    VariantSpec,
};
use prisradar_oracle::{extract, Oracle, OracleError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MIN_CONFIDENCE: f64 = 0.7;
pub const MIN_TITLE_SIMILARITY: f64 = 0.6;

const SCHEMA_NAME: &str = "listing_match";

const SYSTEM_PROMPT: &str = "\
You match Norwegian second-hand and retail price listings to product variants.
Assign every listing to exactly one variant or leave it unmatched.

Confidence rules:
- Storage/capacity AND color both match exactly: confidence above 0.9.
- Only one of storage/capacity or color matches: confidence between 0.7 and 0.9.
- Anything weaker: do not match, put the listing index in unmatched_listings.
Never put a listing with confidence below 0.7 into a matched group.

Quality tiers (condition_quality):
- New-condition listings from retailers are always \"excellent\".
- Used listings are classified from the title:
  excellent: \"ny\", \"ubrukt\", \"perfekt\", \"som ny\", \"i eske\"
  good: \"lite brukt\", \"god stand\", \"fungerer perfekt\"
  acceptable: \"brukt\", \"normal slitasje\"
  poor: \"defekt\", \"ødelagt\", \"trenger reparasjon\"
  When no cue is present, use \"acceptable\".

Per matched variant return the price range (min, max, median) and a per-tier
breakdown. Echo each listing's title, price and url unchanged.
Write market_insights.summary (2-3 sentences) and recommendation (1 sentence)
in Norwegian.";

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("matching oracle failed: {0}")]
    Oracle(#[from] OracleError),
    #[error("could not encode matcher input: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Oracle answer for one listing inside a matched group.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListingAnswer {
    /// The `index` of the listing in the input.
    pub listing_index: usize,
    /// Match confidence between 0.0 and 1.0.
    pub confidence: f64,
    pub condition_quality: QualityTier,
    pub price: f64,
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TierAnswer {
    pub tier: QualityTier,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GroupAnswer {
    /// The `id` of the matched variant.
    pub variant_id: String,
    pub listings: Vec<ListingAnswer>,
    pub price_range: PriceRange,
    pub quality_tiers: Vec<TierAnswer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatchAnswer {
    pub matched_listings: Vec<GroupAnswer>,
    /// Indices of listings that match no variant.
    pub unmatched_listings: Vec<usize>,
    pub market_insights: MarketInsights,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedListing {
    pub listing: ScrapedListing,
    pub confidence: f64,
    pub tier: QualityTier,
}

/// Validated listings for one variant. `price_range` and `tiers` cover the used
/// listings when the group has any, otherwise every listing.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedGroup {
    pub variant_id: Uuid,
    pub listings: Vec<MatchedListing>,
    pub price_range: PriceRange,
    pub tiers: BTreeMap<QualityTier, TierStats>,
}

impl MatchedGroup {
    fn from_listings(variant_id: Uuid, listings: Vec<MatchedListing>) -> Option<Self> {
        let has_used = listings.iter().any(|m| m.listing.condition == Condition::Used);
        let basis: Vec<&MatchedListing> = listings
            .iter()
            .filter(|m| !has_used || m.listing.condition == Condition::Used)
            .collect();
        let prices: Vec<f64> = basis.iter().map(|m| m.listing.price).collect();
        let price_range = PriceRange::from_prices(&prices)?;
        let tiers = tier_breakdown(basis.iter().map(|m| (m.tier, m.listing.price)));
        Some(Self {
            variant_id,
            listings,
            price_range,
            tiers,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub groups: Vec<MatchedGroup>,
    pub unmatched: Vec<usize>,
    pub market_insights: MarketInsights,
}

#[derive(Clone)]
pub struct Matcher {
    oracle: Arc<dyn Oracle>,
}

impl Matcher {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self { oracle }
    }

    /// `Ok(None)` when there is nothing to match. Oracle failures and answers
    /// that do not fit the schema are errors; the caller skips persistence.
    pub async fn match_listings(
        &self,
        product_name: &str,
        category: &str,
        variants: &[VariantSpec],
        listings: &[ScrapedListing],
    ) -> Result<Option<MatchOutcome>, MatchError> {
        if variants.is_empty() || listings.is_empty() {
            return Ok(None);
        }
        let user = build_instruction(product_name, category, variants, listings)?;
        let answer: MatchAnswer = extract(self.oracle.as_ref(), SCHEMA_NAME, SYSTEM_PROMPT, user).await?;
        Ok(Some(validate(answer, variants, listings)))
    }
}

fn build_instruction(
    product_name: &str,
    category: &str,
    variants: &[VariantSpec],
    listings: &[ScrapedListing],
) -> Result<String, serde_json::Error> {
    let indexed: Vec<_> = listings
        .iter()
        .enumerate()
        .map(|(index, l)| {
            json!({
                "index": index,
                "merchant": l.merchant_name,
                "title": l.title,
                "price": l.price,
                "url": l.url,
                "condition": l.condition,
            })
        })
        .collect();
    Ok(format!(
        "Product: {product_name}\nCategory: {category}\n\nVariants:\n{}\n\nListings:\n{}",
        serde_json::to_string_pretty(variants)?,
        serde_json::to_string_pretty(&indexed)?,
    ))
}

fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn titles_agree(echoed: &str, scraped: &str) -> bool {
    jaro_winkler(&normalize_title(echoed), &normalize_title(scraped)) >= MIN_TITLE_SIMILARITY
}

/// Keeps only answer entries that hold up against the input. Everything else
/// ends up in `unmatched`.
pub fn validate(answer: MatchAnswer, variants: &[VariantSpec], listings: &[ScrapedListing]) -> MatchOutcome {
    let known: HashSet<Uuid> = variants.iter().map(|v| v.id).collect();
    let mut seen: HashSet<usize> = HashSet::new();
    let mut order: Vec<Uuid> = Vec::new();
    let mut by_variant: HashMap<Uuid, Vec<MatchedListing>> = HashMap::new();

    for group in answer.matched_listings {
        let variant_id = match Uuid::parse_str(group.variant_id.trim()) {
            Ok(id) if known.contains(&id) => id,
            _ => {
                warn!(variant_id = %group.variant_id, "oracle matched an unknown variant");
                continue;
            }
        };
        for entry in group.listings {
            let Some(listing) = listings.get(entry.listing_index) else {
                debug!(index = entry.listing_index, "listing index out of range");
                continue;
            };
            if seen.contains(&entry.listing_index) {
                debug!(index = entry.listing_index, "listing matched twice");
                continue;
            }
            if !entry.confidence.is_finite()
                || !(MIN_CONFIDENCE..=1.0).contains(&entry.confidence)
            {
                continue;
            }
            if !titles_agree(&entry.title, &listing.title) {
                debug!(index = entry.listing_index, echoed = %entry.title, "echoed title does not match listing");
                continue;
            }
            let tier = match listing.condition {
                Condition::New => QualityTier::Excellent,
                Condition::Used => entry.condition_quality,
            };
            seen.insert(entry.listing_index);
            if !by_variant.contains_key(&variant_id) {
                order.push(variant_id);
            }
            by_variant.entry(variant_id).or_default().push(MatchedListing {
                listing: listing.clone(),
                confidence: entry.confidence,
                tier,
            });
        }
    }

    let groups = order
        .into_iter()
        .filter_map(|id| {
            let matched = by_variant.remove(&id)?;
            MatchedGroup::from_listings(id, matched)
        })
        .collect();
    let unmatched = (0..listings.len()).filter(|i| !seen.contains(i)).collect();

    MatchOutcome {
        groups,
        unmatched,
        market_insights: answer.market_insights,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prisradar_core::PriceTrend;
    use prisradar_oracle::ScriptedOracle;
    use serde_json::Value;

    fn airpods_variant() -> VariantSpec {
        VariantSpec {
            id: Uuid::from_u128(0xA1),
            storage_gb: None,
            color: Some("hvit".into()),
            model: Some("AirPods Pro (2. generasjon)".into()),
        }
    }

    fn used(title: &str, price: f64) -> ScrapedListing {
        ScrapedListing {
            merchant_name: "Finn.no".into(),
            price,
            condition: Condition::Used,
            url: "https://www.finn.no/bap/forsale/search.html?q=AirPods+Pro".into(),
            title: title.into(),
        }
    }

    fn airpods_listings() -> Vec<ScrapedListing> {
        vec![
            used("AirPods Pro som ny", 1800.0),
            used("AirPods Pro god stand", 1500.0),
            used("AirPods Pro defekt høyre øretelefon", 600.0),
        ]
    }

    fn entry(index: usize, confidence: f64, tier: &str, title: &str, price: f64) -> Value {
        json!({
            "listing_index": index,
            "confidence": confidence,
            "condition_quality": tier,
            "price": price,
            "url": "https://www.finn.no/item/1",
            "title": title,
        })
    }

    fn answer(variant_id: &str, listings: Vec<Value>, unmatched: Vec<usize>) -> Value {
        json!({
            "matched_listings": [{
                "variant_id": variant_id,
                "listings": listings,
                "price_range": { "min": 0.0, "max": 0.0, "median": 0.0 },
                "quality_tiers": [],
            }],
            "unmatched_listings": unmatched,
            "market_insights": {
                "summary": "Brukte AirPods Pro selges jevnt på Finn.",
                "price_trend": "stable",
                "best_value_tier": "good",
                "recommendation": "Velg en i god stand for best verdi.",
            }
        })
    }

    fn matcher_with(oracle: Arc<ScriptedOracle>) -> Matcher {
        Matcher::new(oracle)
    }

    #[tokio::test]
    async fn airpods_listings_are_tiered_and_summarized() {
        let oracle = Arc::new(ScriptedOracle::new());
        let variant = airpods_variant();
        oracle
            .push(
                SCHEMA_NAME,
                Ok(answer(
                    &variant.id.to_string(),
                    vec![
                        entry(0, 0.92, "excellent", "AirPods Pro som ny", 1800.0),
                        entry(1, 0.9, "good", "AirPods Pro god stand", 1500.0),
                        entry(2, 0.88, "poor", "AirPods Pro defekt høyre øretelefon", 600.0),
                    ],
                    vec![],
                )),
            )
            .await;

        let outcome = matcher_with(oracle.clone())
            .match_listings("AirPods Pro", "headphones", &[variant.clone()], &airpods_listings())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.groups.len(), 1);
        let group = &outcome.groups[0];
        let tiers: Vec<QualityTier> = group.listings.iter().map(|m| m.tier).collect();
        assert_eq!(
            tiers,
            vec![QualityTier::Excellent, QualityTier::Good, QualityTier::Poor]
        );
        assert_eq!(
            group.price_range,
            PriceRange {
                min: 600.0,
                max: 1800.0,
                median: 1500.0
            }
        );
        assert_eq!(group.tiers.len(), 3);
        assert!(group.tiers.values().all(|t| t.count == 1));
        assert!(outcome.unmatched.is_empty());
        assert_eq!(outcome.market_insights.price_trend, PriceTrend::Stable);

        let request = &oracle.requests().await[0];
        assert!(request.user.contains("AirPods Pro defekt"));
        assert!(request.system.contains("trenger reparasjon"));
        assert_eq!(request.schema["additionalProperties"], Value::Bool(false));
    }

    #[tokio::test]
    async fn low_confidence_and_bad_entries_become_unmatched() {
        let oracle = Arc::new(ScriptedOracle::new());
        let variant = airpods_variant();
        oracle
            .push(
                SCHEMA_NAME,
                Ok(answer(
                    &variant.id.to_string(),
                    vec![
                        entry(0, 0.65, "excellent", "AirPods Pro som ny", 1800.0),
                        entry(1, 0.9, "good", "Xbox Series X kontroller", 1500.0),
                        entry(2, 0.8, "poor", "AirPods Pro defekt høyre øretelefon", 600.0),
                        entry(2, 0.95, "poor", "AirPods Pro defekt høyre øretelefon", 600.0),
                        entry(7, 0.95, "good", "AirPods Pro", 999.0),
                    ],
                    vec![],
                )),
            )
            .await;

        let outcome = matcher_with(oracle)
            .match_listings("AirPods Pro", "headphones", &[variant], &airpods_listings())
            .await
            .unwrap()
            .unwrap();

        let group = &outcome.groups[0];
        assert_eq!(group.listings.len(), 1);
        assert_eq!(group.listings[0].confidence, 0.8);
        assert!(group.listings.iter().all(|m| m.confidence >= MIN_CONFIDENCE));
        assert_eq!(outcome.unmatched, vec![0, 1]);
    }

    #[tokio::test]
    async fn unknown_variants_are_dropped() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle
            .push(
                SCHEMA_NAME,
                Ok(answer(
                    &Uuid::from_u128(0xFF).to_string(),
                    vec![entry(0, 0.95, "excellent", "AirPods Pro som ny", 1800.0)],
                    vec![],
                )),
            )
            .await;
        let outcome = matcher_with(oracle)
            .match_listings("AirPods Pro", "headphones", &[airpods_variant()], &airpods_listings())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.groups.is_empty());
        assert_eq!(outcome.unmatched, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn retail_listings_are_always_excellent_and_range_covers_used_only() {
        let oracle = Arc::new(ScriptedOracle::new());
        let variant = airpods_variant();
        let mut listings = airpods_listings();
        listings.push(ScrapedListing {
            merchant_name: "Elkjøp".into(),
            price: 2990.0,
            condition: Condition::New,
            url: "https://www.elkjop.no/lyd/airpods".into(),
            title: "Apple AirPods Pro 2 USB-C".into(),
        });
        oracle
            .push(
                SCHEMA_NAME,
                Ok(answer(
                    &variant.id.to_string(),
                    vec![
                        entry(1, 0.9, "good", "AirPods Pro god stand", 1500.0),
                        entry(3, 0.93, "acceptable", "Apple AirPods Pro 2 USB-C", 2990.0),
                    ],
                    vec![0, 2],
                )),
            )
            .await;

        let outcome = matcher_with(oracle)
            .match_listings("AirPods Pro", "headphones", &[variant], &listings)
            .await
            .unwrap()
            .unwrap();

        let group = &outcome.groups[0];
        assert_eq!(group.listings[1].tier, QualityTier::Excellent);
        assert_eq!(group.price_range.max, 1500.0);
        assert_eq!(group.tiers.len(), 1);
    }

    #[tokio::test]
    async fn empty_input_skips_the_oracle() {
        let oracle = Arc::new(ScriptedOracle::new());
        let matcher = matcher_with(oracle.clone());
        let none = matcher
            .match_listings("AirPods Pro", "headphones", &[airpods_variant()], &[])
            .await
            .unwrap();
        assert!(none.is_none());
        let none = matcher
            .match_listings("AirPods Pro", "headphones", &[], &airpods_listings())
            .await
            .unwrap();
        assert!(none.is_none());
        assert_eq!(oracle.call_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_answer_is_an_error() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle
            .push(SCHEMA_NAME, Ok(json!({ "matched_listings": "nope" })))
            .await;
        let err = matcher_with(oracle)
            .match_listings("AirPods Pro", "headphones", &[airpods_variant()], &airpods_listings())
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::Oracle(OracleError::Schema { .. })));
    }
}
