//! In-process `Store` used by tests and by catalog-file runs without a database.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use prisradar_core::{
    AiJob, Budget, CacheEntry, JobResult, JobStatus, MerchantListing, MerchantUrl,
    NormalizedOffer, Product, ProductAttribute, ProductVariant, VariantPriceUpdate,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{Store, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    products: Vec<Product>,
    variants: Vec<ProductVariant>,
    merchant_urls: Vec<MerchantUrl>,
    listings: Vec<MerchantListing>,
    budgets: HashMap<NaiveDate, Budget>,
    jobs: Vec<AiJob>,
    cache: HashMap<String, CacheEntry>,
    normalized_offers: Vec<NormalizedOffer>,
    attributes: Vec<ProductAttribute>,
}

/// All tables behind one lock, so every trait operation is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: CatalogSeed) -> Self {
        let mut state = MemoryState::default();
        for entry in seed.products {
            let product = Product {
                id: entry.id.unwrap_or_else(Uuid::new_v4),
                name: entry.name,
                category: entry.category,
                priority_score: entry.priority_score,
                scrape_frequency_hours: entry.scrape_frequency_hours,
                last_scraped_at: None,
            };
            for variant in entry.variants {
                state.variants.push(ProductVariant {
                    id: variant.id.unwrap_or_else(Uuid::new_v4),
                    product_id: product.id,
                    storage_gb: variant.storage_gb,
                    color: variant.color,
                    model: variant.model,
                    price_new: None,
                    price_used: None,
                    confidence: None,
                    price_data: None,
                    updated_at: None,
                });
            }
            state.products.push(product);
        }
        for url in seed.merchant_urls {
            state.merchant_urls.push(MerchantUrl {
                id: Uuid::new_v4(),
                category: url.category,
                merchant_name: url.merchant_name,
                url: url.url,
                active: url.active,
                last_scraped_at: None,
            });
        }
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn insert_product(&self, product: Product) {
        self.state.lock().await.products.push(product);
    }

    pub async fn insert_variant(&self, variant: ProductVariant) {
        self.state.lock().await.variants.push(variant);
    }

    pub async fn insert_merchant_url(&self, url: MerchantUrl) {
        self.state.lock().await.merchant_urls.push(url);
    }

    pub async fn put_budget(&self, budget: Budget) {
        self.state.lock().await.budgets.insert(budget.date, budget);
    }

    pub async fn product(&self, id: Uuid) -> Option<Product> {
        self.state.lock().await.products.iter().find(|p| p.id == id).cloned()
    }

    pub async fn variant(&self, id: Uuid) -> Option<ProductVariant> {
        self.state.lock().await.variants.iter().find(|v| v.id == id).cloned()
    }

    pub async fn merchant_urls(&self) -> Vec<MerchantUrl> {
        self.state.lock().await.merchant_urls.clone()
    }

    pub async fn normalized_offers(&self) -> Vec<NormalizedOffer> {
        self.state.lock().await.normalized_offers.clone()
    }

    pub async fn product_attributes(&self) -> Vec<ProductAttribute> {
        self.state.lock().await.attributes.clone()
    }

    pub async fn jobs(&self) -> Vec<AiJob> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn insert_cache_entry(&self, entry: CacheEntry) {
        self.state
            .lock()
            .await
            .cache
            .insert(entry.cache_key.clone(), entry);
    }
}

fn finish_job(
    state: &mut MemoryState,
    id: Uuid,
    to: JobStatus,
    now: DateTime<Utc>,
) -> Result<&mut AiJob, StoreError> {
    let job = state
        .jobs
        .iter_mut()
        .find(|j| j.id == id)
        .ok_or_else(|| StoreError::not_found("job", id))?;
    if !job.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            id,
            from: job.status,
            to,
        });
    }
    job.status = to;
    job.updated_at = now;
    Ok(job)
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let mut products = self.state.lock().await.products.clone();
        products.sort_by(|a, b| b.priority_score.cmp(&a.priority_score));
        Ok(products)
    }

    async fn list_variants(&self, product_id: Uuid) -> Result<Vec<ProductVariant>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .variants
            .iter()
            .filter(|v| v.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn list_active_merchant_urls(&self, category: &str) -> Result<Vec<MerchantUrl>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .merchant_urls
            .iter()
            .filter(|u| u.active && u.category == category)
            .cloned()
            .collect())
    }

    async fn touch_product(&self, product_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let product = state
            .products
            .iter_mut()
            .find(|p| p.id == product_id)
            .ok_or_else(|| StoreError::not_found("product", product_id))?;
        product.last_scraped_at = Some(at);
        Ok(())
    }

    async fn touch_merchant_url(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let url = state
            .merchant_urls
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| StoreError::not_found("merchant url", id))?;
        url.last_scraped_at = Some(at);
        Ok(())
    }

    async fn update_product_schedule(
        &self,
        product_id: Uuid,
        priority_score: i32,
        scrape_frequency_hours: f64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let product = state
            .products
            .iter_mut()
            .find(|p| p.id == product_id)
            .ok_or_else(|| StoreError::not_found("product", product_id))?;
        product.priority_score = priority_score;
        product.scrape_frequency_hours = Some(scrape_frequency_hours);
        Ok(())
    }

    async fn replace_variant_listings(
        &self,
        variant_id: Uuid,
        listings: &[MerchantListing],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.listings.retain(|l| l.variant_id != variant_id);
        state.listings.extend(listings.iter().cloned());
        Ok(())
    }

    async fn list_variant_listings(&self, variant_id: Uuid) -> Result<Vec<MerchantListing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .iter()
            .filter(|l| l.variant_id == variant_id)
            .cloned()
            .collect())
    }

    async fn persist_variant_pass(
        &self,
        variant_id: Uuid,
        listings: &[MerchantListing],
        update: &VariantPriceUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let index = state
            .variants
            .iter()
            .position(|v| v.id == variant_id)
            .ok_or_else(|| StoreError::not_found("variant", variant_id))?;
        state.listings.retain(|l| l.variant_id != variant_id);
        state.listings.extend(listings.iter().cloned());

        let variant = &mut state.variants[index];
        variant.price_new = update.price_new;
        variant.price_used = update.price_used;
        variant.confidence = Some(update.confidence);
        variant.price_data = Some(update.price_data.clone());
        variant.updated_at = Some(update.updated_at);
        Ok(())
    }

    async fn product_listing_confidences(
        &self,
        product_id: Uuid,
        limit: usize,
    ) -> Result<Vec<f64>, StoreError> {
        let state = self.state.lock().await;
        let variant_ids: Vec<Uuid> = state
            .variants
            .iter()
            .filter(|v| v.product_id == product_id)
            .map(|v| v.id)
            .collect();
        Ok(state
            .listings
            .iter()
            .filter(|l| variant_ids.contains(&l.variant_id))
            .take(limit)
            .map(|l| l.confidence)
            .collect())
    }

    async fn get_or_create_budget(&self, date: NaiveDate, total: i32) -> Result<Budget, StoreError> {
        let mut state = self.state.lock().await;
        Ok(*state
            .budgets
            .entry(date)
            .or_insert_with(|| Budget::fresh(date, total)))
    }

    async fn try_spend_budget(&self, date: NaiveDate, amount: i32) -> Result<Option<Budget>, StoreError> {
        let mut state = self.state.lock().await;
        let budget = state
            .budgets
            .get_mut(&date)
            .ok_or_else(|| StoreError::not_found("budget", date))?;
        match budget.allocate(amount) {
            Ok(next) => {
                *budget = next;
                Ok(Some(next))
            }
            Err(_) => Ok(None),
        }
    }

    async fn reset_budget(&self, date: NaiveDate, total: i32) -> Result<Budget, StoreError> {
        let mut state = self.state.lock().await;
        let fresh = Budget::fresh(date, total);
        state.budgets.insert(date, fresh);
        Ok(fresh)
    }

    async fn insert_job(&self, job: &AiJob) -> Result<(), StoreError> {
        self.state.lock().await.jobs.push(job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<AiJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn claim_pending_jobs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<AiJob>, StoreError> {
        let mut state = self.state.lock().await;
        let mut pending: Vec<&mut AiJob> = state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|j| j.created_at);
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Processing;
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn requeue_stale_jobs(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at < cutoff)
        {
            job.status = JobStatus::Pending;
            job.updated_at = now;
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn complete_job(&self, id: Uuid, result: &JobResult, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = finish_job(&mut state, id, JobStatus::Completed, now)?;
        job.result = Some(result.clone());
        job.processed_at = Some(now);
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = finish_job(&mut state, id, JobStatus::Failed, now)?;
        job.error = Some(error.to_string());
        Ok(())
    }

    async fn get_cache_entry(&self, cache_key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .cache
            .get(cache_key)
            .filter(|entry| entry.is_live(now))
            .cloned())
    }

    async fn put_cache_entry_if_absent(
        &self,
        entry: &CacheEntry,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.cache.get(&entry.cache_key) {
            if existing.is_live(now) {
                return Ok(existing.clone());
            }
        }
        state.cache.insert(entry.cache_key.clone(), entry.clone());
        Ok(entry.clone())
    }

    async fn insert_normalized_offer(&self, offer: &NormalizedOffer) -> Result<(), StoreError> {
        self.state.lock().await.normalized_offers.push(offer.clone());
        Ok(())
    }

    async fn insert_product_attributes(&self, attributes: &[ProductAttribute]) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .attributes
            .extend(attributes.iter().cloned());
        Ok(())
    }
}

/// YAML catalog used to seed a `MemoryStore`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub products: Vec<SeedProduct>,
    #[serde(default)]
    pub merchant_urls: Vec<SeedMerchantUrl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedProduct {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub priority_score: i32,
    #[serde(default)]
    pub scrape_frequency_hours: Option<f64>,
    #[serde(default)]
    pub variants: Vec<SeedVariant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedVariant {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub storage_gb: Option<i32>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedMerchantUrl {
    pub category: String,
    pub merchant_name: String,
    pub url: String,
    #[serde(default = "seed_active_default")]
    pub active: bool,
}

fn seed_active_default() -> bool {
    true
}

impl CatalogSeed {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use prisradar_core::{
        AlertEmail, AlertEmailPayload, Condition, JobTask, MarketInsights, PriceData, PriceTrend, QualityTier,
    };

    const SEED: &str = r#"
products:
  - name: AirPods Pro
    category: headphones
    priority_score: 40
    variants:
      - color: white
  - name: iPhone 15
    category: smartphone
    priority_score: 90
    scrape_frequency_hours: 12
    variants:
      - storage_gb: 128
        color: black
      - storage_gb: 256
        color: blue
merchant_urls:
  - category: smartphone
    merchant_name: Elkjøp
    url: https://www.elkjop.no/mobil
  - category: smartphone
    merchant_name: Power
    url: https://www.power.no/mobil
    active: false
"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn listing(variant_id: Uuid, group: Uuid, price: f64) -> MerchantListing {
        MerchantListing {
            id: Uuid::new_v4(),
            variant_id,
            merchant_name: "Finn.no".into(),
            price,
            condition: Condition::Used,
            url: "https://www.finn.no/item/1".into(),
            confidence: 0.9,
            price_tier: QualityTier::Good,
            listing_group_id: group,
            market_insight: None,
            is_valid: true,
            scraped_at: now(),
        }
    }

    fn alert_job(at: DateTime<Utc>) -> AiJob {
        AiJob::pending(
            JobTask::WriteAlertEmail(AlertEmailPayload {
                product_name: "iPhone 15".into(),
                target_price: 9000.0,
                current_price: 8490.0,
                merchant_name: "Power".into(),
                product_url: None,
            }),
            None,
            at,
        )
    }

    #[tokio::test]
    async fn seed_loads_catalog_ordered_by_priority() {
        let store = MemoryStore::from_seed(CatalogSeed::from_yaml_str(SEED).unwrap());
        let products = store.list_products().await.unwrap();
        assert_eq!(products[0].name, "iPhone 15");
        assert_eq!(products[0].scrape_frequency_hours, Some(12.0));
        assert_eq!(store.list_variants(products[0].id).await.unwrap().len(), 2);

        let urls = store.list_active_merchant_urls("smartphone").await.unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].merchant_name, "Elkjøp");
    }

    #[tokio::test]
    async fn seed_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        tokio::fs::write(&path, SEED).await.unwrap();
        let seed = CatalogSeed::from_path(&path).await.unwrap();
        assert_eq!(seed.products.len(), 2);
        assert!(!seed.merchant_urls[1].active);
    }

    #[tokio::test]
    async fn replace_listings_leaves_only_the_new_group() {
        let store = MemoryStore::new();
        let variant = Uuid::new_v4();
        let other = Uuid::new_v4();
        let old_group = Uuid::new_v4();
        store
            .replace_variant_listings(
                variant,
                &[listing(variant, old_group, 1000.0), listing(variant, old_group, 1100.0)],
            )
            .await
            .unwrap();
        store
            .replace_variant_listings(other, &[listing(other, old_group, 500.0)])
            .await
            .unwrap();

        let new_group = Uuid::new_v4();
        store
            .replace_variant_listings(variant, &[listing(variant, new_group, 1200.0)])
            .await
            .unwrap();

        let rows = store.list_variant_listings(variant).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows.iter().all(|r| r.listing_group_id == new_group));
        assert_eq!(store.list_variant_listings(other).await.unwrap().len(), 1);
    }

    fn price_update(price_used: f64) -> VariantPriceUpdate {
        VariantPriceUpdate {
            price_new: None,
            price_used: Some(price_used),
            confidence: 0.9,
            price_data: PriceData {
                new: None,
                used: None,
                market_insights: MarketInsights {
                    summary: "Stabilt bruktmarked.".into(),
                    price_trend: PriceTrend::Stable,
                    best_value_tier: QualityTier::Good,
                    recommendation: "Kjøp i god stand.".into(),
                },
            },
            updated_at: now(),
        }
    }

    #[tokio::test]
    async fn variant_pass_rewrites_listings_and_prices_together() {
        let store = MemoryStore::from_seed(CatalogSeed::from_yaml_str(SEED).unwrap());
        let product = store.list_products().await.unwrap().remove(0);
        let variant = store.list_variants(product.id).await.unwrap().remove(0).id;
        let group = Uuid::new_v4();

        store
            .persist_variant_pass(variant, &[listing(variant, group, 7900.0)], &price_update(7900.0))
            .await
            .unwrap();

        let rows = store.list_variant_listings(variant).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].listing_group_id, group);
        let stored = store.variant(variant).await.unwrap();
        assert_eq!(stored.price_used, Some(7900.0));
        assert_eq!(stored.confidence, Some(0.9));
    }

    #[tokio::test]
    async fn failed_variant_pass_keeps_previous_listings() {
        let store = MemoryStore::new();
        let deleted_variant = Uuid::new_v4();
        let old_group = Uuid::new_v4();
        store
            .replace_variant_listings(deleted_variant, &[listing(deleted_variant, old_group, 1500.0)])
            .await
            .unwrap();

        let err = store
            .persist_variant_pass(
                deleted_variant,
                &[listing(deleted_variant, Uuid::new_v4(), 1800.0)],
                &price_update(1800.0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "variant", .. }));

        let rows = store.list_variant_listings(deleted_variant).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].listing_group_id, old_group);
        assert_eq!(rows[0].price, 1500.0);
    }

    #[tokio::test]
    async fn conditional_spend_refuses_overcommit() {
        let store = MemoryStore::new();
        let date = now().date_naive();
        store.get_or_create_budget(date, 2).await.unwrap();
        assert!(store.try_spend_budget(date, 2).await.unwrap().is_some());
        assert!(store.try_spend_budget(date, 1).await.unwrap().is_none());
        let budget = store.get_or_create_budget(date, 2).await.unwrap();
        assert_eq!((budget.used, budget.remaining), (2, 0));
    }

    #[tokio::test]
    async fn claim_takes_oldest_pending_and_marks_processing() {
        let store = MemoryStore::new();
        let older = alert_job(now());
        let newer = alert_job(now() + chrono::Duration::minutes(5));
        store.insert_job(&newer).await.unwrap();
        store.insert_job(&older).await.unwrap();

        let claimed = store.claim_pending_jobs(1, now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, older.id);
        assert_eq!(claimed[0].status, JobStatus::Processing);

        let again = store.claim_pending_jobs(10, now()).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, newer.id);
    }

    #[tokio::test]
    async fn only_stale_processing_jobs_are_requeued() {
        let store = MemoryStore::new();
        let stale = alert_job(now());
        let fresh = alert_job(now() + chrono::Duration::minutes(1));
        let done = alert_job(now() + chrono::Duration::minutes(2));
        for job in [&stale, &fresh, &done] {
            store.insert_job(job).await.unwrap();
        }
        store.claim_pending_jobs(1, now()).await.unwrap();
        let later = now() + chrono::Duration::minutes(30);
        store.claim_pending_jobs(2, later).await.unwrap();
        store.fail_job(done.id, "boom", later).await.unwrap();

        let requeued = store
            .requeue_stale_jobs(now() + chrono::Duration::minutes(20), later)
            .await
            .unwrap();

        assert_eq!(requeued, 1);
        assert_eq!(store.get_job(stale.id).await.unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(store.get_job(fresh.id).await.unwrap().unwrap().status, JobStatus::Processing);
        assert_eq!(store.get_job(done.id).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn terminal_jobs_reject_further_transitions() {
        let store = MemoryStore::new();
        let job = alert_job(now());
        store.insert_job(&job).await.unwrap();

        let err = store.fail_job(job.id, "boom", now()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store.claim_pending_jobs(1, now()).await.unwrap();
        store.fail_job(job.id, "boom", now()).await.unwrap();
        let result = JobResult::WriteAlertEmail(AlertEmail {
            subject: "s".into(),
            body: "b".into(),
        });
        assert!(store.complete_job(job.id, &result, now()).await.is_err());
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cache_insert_keeps_live_entry_and_replaces_expired() {
        let store = MemoryStore::new();
        let first = CacheEntry::new(
            "key",
            JobResult::WriteAlertEmail(AlertEmail {
                subject: "first".into(),
                body: "b".into(),
            }),
            now(),
        );
        let second = CacheEntry::new(
            "key",
            JobResult::WriteAlertEmail(AlertEmail {
                subject: "second".into(),
                body: "b".into(),
            }),
            now(),
        );
        store.put_cache_entry_if_absent(&first, now()).await.unwrap();
        let kept = store.put_cache_entry_if_absent(&second, now()).await.unwrap();
        assert_eq!(kept, first);

        let later = now() + chrono::Duration::hours(73);
        assert!(store.get_cache_entry("key", later).await.unwrap().is_none());
        let replaced = store.put_cache_entry_if_absent(&second, later).await.unwrap();
        assert_eq!(replaced, second);
    }
}
