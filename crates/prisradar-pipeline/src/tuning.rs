//! Adjusts scrape priority and frequency from how confidently a product's
//! listings have been matching.

use anyhow::{Context, Result};
use prisradar_core::{mean, Product};
use prisradar_storage::Store;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const CONFIDENCE_SAMPLE: usize = 100;

const LOW_CONFIDENCE: f64 = 0.7;
const HIGH_CONFIDENCE: f64 = 0.95;
const PRIORITY_STEP: i32 = 10;
const PRIORITY_MAX: i32 = 100;
const PRIORITY_MIN: i32 = 10;
const FREQUENCY_MIN_HOURS: f64 = 1.0;
const FREQUENCY_MAX_HOURS: f64 = 168.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityUpdate {
    pub product_id: Uuid,
    pub name: String,
    pub mean_confidence: f64,
    pub priority_before: i32,
    pub priority_after: i32,
    pub frequency_hours_before: f64,
    pub frequency_hours_after: f64,
}

/// New `(priority_score, scrape_frequency_hours)` for a mean confidence, or
/// `None` when the product should stay as it is.
pub fn retune(priority: i32, frequency_hours: f64, mean_confidence: f64) -> Option<(i32, f64)> {
    if mean_confidence < LOW_CONFIDENCE {
        Some((
            (priority + PRIORITY_STEP).min(PRIORITY_MAX),
            (frequency_hours / 2.0).max(FREQUENCY_MIN_HOURS),
        ))
    } else if mean_confidence > HIGH_CONFIDENCE {
        Some((
            (priority - PRIORITY_STEP).max(PRIORITY_MIN),
            (frequency_hours * 1.5).min(FREQUENCY_MAX_HOURS),
        ))
    } else {
        None
    }
}

/// Low-confidence products get scraped sooner and more often, settled ones
/// less. Products without listings are left alone.
pub async fn tune_priorities(store: &dyn Store, default_frequency_hours: f64) -> Result<Vec<PriorityUpdate>> {
    let products = store.list_products().await.context("reading product catalog")?;
    let mut updates = Vec::new();
    for product in products {
        match tune_product(store, &product, default_frequency_hours).await {
            Ok(Some(update)) => updates.push(update),
            Ok(None) => {}
            Err(err) => warn!(product_id = %product.id, error = %err, "could not tune product"),
        }
    }
    info!(updated = updates.len(), "priority tuning finished");
    Ok(updates)
}

async fn tune_product(
    store: &dyn Store,
    product: &Product,
    default_frequency_hours: f64,
) -> Result<Option<PriorityUpdate>> {
    let confidences = store
        .product_listing_confidences(product.id, CONFIDENCE_SAMPLE)
        .await?;
    let Some(mean_confidence) = mean(&confidences) else {
        return Ok(None);
    };
    let frequency = product.frequency_hours(default_frequency_hours);
    let Some((priority, frequency_after)) = retune(product.priority_score, frequency, mean_confidence) else {
        return Ok(None);
    };
    store
        .update_product_schedule(product.id, priority, frequency_after)
        .await?;
    Ok(Some(PriorityUpdate {
        product_id: product.id,
        name: product.name.clone(),
        mean_confidence,
        priority_before: product.priority_score,
        priority_after: priority,
        frequency_hours_before: frequency,
        frequency_hours_after: frequency_after,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prisradar_core::{Condition, MerchantListing, ProductVariant, QualityTier};
    use prisradar_storage::MemoryStore;

    #[test]
    fn retune_moves_both_knobs_within_bounds() {
        assert_eq!(retune(50, 24.0, 0.5), Some((60, 12.0)));
        assert_eq!(retune(95, 1.5, 0.5), Some((100, 1.0)));
        assert_eq!(retune(50, 24.0, 0.97), Some((40, 36.0)));
        assert_eq!(retune(15, 150.0, 0.99), Some((10, 168.0)));
        assert_eq!(retune(50, 24.0, 0.8), None);
    }

    fn listing(variant_id: Uuid, confidence: f64) -> MerchantListing {
        MerchantListing {
            id: Uuid::new_v4(),
            variant_id,
            merchant_name: "Finn.no".into(),
            price: 1500.0,
            condition: Condition::Used,
            url: "https://www.finn.no/item/1".into(),
            confidence,
            price_tier: QualityTier::Good,
            listing_group_id: Uuid::from_u128(7),
            market_insight: None,
            is_valid: true,
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn uncertain_products_are_scraped_more_often() {
        let store = MemoryStore::new();
        let product = Product {
            id: Uuid::from_u128(1),
            name: "AirPods Pro".into(),
            category: "headphones".into(),
            priority_score: 50,
            scrape_frequency_hours: None,
            last_scraped_at: None,
        };
        let quiet = Product {
            id: Uuid::from_u128(2),
            name: "Ukjent".into(),
            ..product.clone()
        };
        store.insert_product(product.clone()).await;
        store.insert_product(quiet.clone()).await;
        let variant_id = Uuid::from_u128(11);
        store
            .insert_variant(ProductVariant {
                id: variant_id,
                product_id: product.id,
                storage_gb: None,
                color: None,
                model: None,
                price_new: None,
                price_used: None,
                confidence: None,
                price_data: None,
                updated_at: None,
            })
            .await;
        store
            .replace_variant_listings(variant_id, &[listing(variant_id, 0.6), listing(variant_id, 0.7)])
            .await
            .unwrap();

        let updates = tune_priorities(&store, 24.0).await.unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].priority_after, 60);
        let tuned = store.product(product.id).await.unwrap();
        assert_eq!(tuned.priority_score, 60);
        assert_eq!(tuned.scrape_frequency_hours, Some(12.0));
        assert_eq!(store.product(quiet.id).await.unwrap().priority_score, 50);
    }
}
