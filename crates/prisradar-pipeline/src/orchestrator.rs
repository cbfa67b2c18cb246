//! Scrape-and-match pass over the catalog.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use prisradar_core::{
    mean, Condition, MarketInsights, MerchantListing, MerchantUrl, NewPriceSummary, PriceData,
    Product, ScrapedListing, UsedPriceSummary, VariantPriceUpdate,
};
use prisradar_extract::{BatchPolicy, ExtractOptions, ListingExtractor, SourceTarget};
use prisradar_storage::{Store, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::matcher::{MatchedGroup, Matcher};

const RETAILER_SOURCE: &str = "retailers";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Ignore each product's re-scrape interval.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Processed,
    NotDue,
    NoVariants,
    /// Today's scrape budget ran out before the product could be scraped.
    /// The product keeps its due time so the next run picks it up.
    BudgetExhausted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductOutcome {
    pub product_id: Uuid,
    pub name: String,
    pub status: ProductStatus,
    pub listings_scraped: usize,
    pub variants_updated: usize,
    pub variants_failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProductOutcome {
    fn new(product: &Product, status: ProductStatus) -> Self {
        Self {
            product_id: product.id,
            name: product.name.clone(),
            status,
            listings_scraped: 0,
            variants_updated: 0,
            variants_failed: 0,
            error: None,
        }
    }

    fn failed(product: &Product, listings_scraped: usize, error: impl ToString) -> Self {
        Self {
            listings_scraped,
            error: Some(error.to_string()),
            ..Self::new(product, ProductStatus::Failed)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub products_total: usize,
    pub products_processed: usize,
    pub products_skipped: usize,
    pub products_budget_skipped: usize,
    pub products_failed: usize,
    pub variants_updated: usize,
    pub variants_failed: usize,
    pub listings_scraped: usize,
    pub timed_out: bool,
    /// The day's scrape budget was spent when the run finished.
    pub budget_exhausted: bool,
    pub results: Vec<ProductOutcome>,
}

impl RunSummary {
    fn tally(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        products_total: usize,
        results: Vec<ProductOutcome>,
        timed_out: bool,
        budget_exhausted: bool,
    ) -> Self {
        let count = |status: ProductStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            products_total,
            products_processed: count(ProductStatus::Processed),
            products_skipped: count(ProductStatus::NotDue) + count(ProductStatus::NoVariants),
            products_budget_skipped: count(ProductStatus::BudgetExhausted),
            products_failed: count(ProductStatus::Failed),
            variants_updated: results.iter().map(|r| r.variants_updated).sum(),
            variants_failed: results.iter().map(|r| r.variants_failed).sum(),
            listings_scraped: results.iter().map(|r| r.listings_scraped).sum(),
            timed_out,
            budget_exhausted,
            results,
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    extractor: Arc<ListingExtractor>,
    matcher: Matcher,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        extractor: Arc<ListingExtractor>,
        matcher: Matcher,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            matcher,
            config,
        }
    }

    /// One pass over the catalog. Only a failure to read the catalog is an
    /// error; per-product problems are reported in the summary.
    pub async fn run(&self, options: RunOptions) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, force = options.force);
        self.run_inner(run_id, options).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, options: RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let products = self.store.list_products().await.context("reading product catalog")?;
        let products_total = products.len();

        let mut results = Vec::with_capacity(products_total);
        let mut due = Vec::new();
        for product in products {
            if options.force || product.is_due(started_at, self.config.default_frequency_hours) {
                due.push(product);
            } else {
                debug!(product_id = %product.id, "not due, skipping");
                results.push(ProductOutcome::new(&product, ProductStatus::NotDue));
            }
        }
        info!(products_total, due = due.len(), "pipeline run started");

        let deadline = tokio::time::sleep(self.config.run_timeout);
        tokio::pin!(deadline);
        let pending: Vec<_> = due.iter().map(|product| self.process_product(product)).collect();
        let mut outcomes = stream::iter(pending)
            .buffered(self.config.product_concurrency.max(1));
        let mut timed_out = false;
        loop {
            tokio::select! {
                next = outcomes.next() => match next {
                    Some(outcome) => results.push(outcome),
                    None => break,
                },
                _ = &mut deadline => {
                    timed_out = true;
                    warn!("run timeout reached, abandoning remaining products");
                    break;
                }
            }
        }
        drop(outcomes);

        let summary = RunSummary::tally(
            run_id,
            started_at,
            products_total,
            results,
            timed_out,
            self.extractor.budget_exhausted(),
        );
        info!(
            processed = summary.products_processed,
            skipped = summary.products_skipped,
            budget_skipped = summary.products_budget_skipped,
            budget_exhausted = summary.budget_exhausted,
            failed = summary.products_failed,
            variants_updated = summary.variants_updated,
            listings_scraped = summary.listings_scraped,
            timed_out,
            "pipeline run finished"
        );
        Ok(summary)
    }

    async fn process_product(&self, product: &Product) -> ProductOutcome {
        let span = info_span!("product", product_id = %product.id, name = %product.name);
        async {
            let outcome = self.scrape_and_match(product).await;
            if let Some(error) = &outcome.error {
                warn!(%error, "product pass failed");
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn scrape_and_match(&self, product: &Product) -> ProductOutcome {
        let variants = match self.store.list_variants(product.id).await {
            Ok(variants) => variants,
            Err(err) => return ProductOutcome::failed(product, 0, err),
        };
        if variants.is_empty() {
            debug!("product has no variants");
            return ProductOutcome::new(product, ProductStatus::NoVariants);
        }

        if self.extractor.budget_exhausted() {
            debug!("scrape budget exhausted, leaving product due");
            return ProductOutcome::new(product, ProductStatus::BudgetExhausted);
        }
        let listings = self.collect_listings(product).await;
        if listings.is_empty() && self.extractor.budget_exhausted() {
            debug!("scrape budget ran out while collecting, leaving product due");
            return ProductOutcome::new(product, ProductStatus::BudgetExhausted);
        }
        let listings_scraped = listings.len();
        let specs: Vec<_> = variants.iter().map(|v| v.spec()).collect();

        let matched = tokio::time::timeout(
            self.config.step_timeout,
            self.matcher
                .match_listings(&product.name, &product.category, &specs, &listings),
        )
        .await;
        let outcome = match matched {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return ProductOutcome::failed(product, listings_scraped, err),
            Err(_) => return ProductOutcome::failed(product, listings_scraped, "matching timed out"),
        };

        let mut result = ProductOutcome {
            listings_scraped,
            ..ProductOutcome::new(product, ProductStatus::Processed)
        };
        if let Some(outcome) = outcome {
            debug!(
                groups = outcome.groups.len(),
                unmatched = outcome.unmatched.len(),
                "listings matched"
            );
            for group in &outcome.groups {
                match self
                    .persist_group(product, group, &outcome.market_insights)
                    .await
                {
                    Ok(()) => result.variants_updated += 1,
                    Err(err) => {
                        warn!(variant_id = %group.variant_id, error = %err, "persisting variant failed");
                        result.variants_failed += 1;
                    }
                }
            }
        }

        if let Err(err) = self.store.touch_product(product.id, Utc::now()).await {
            warn!(error = %err, "could not update last_scraped_at");
        }
        result
    }

    /// Marketplace and retailer listings for the product, all sources settled.
    async fn collect_listings(&self, product: &Product) -> Vec<ScrapedListing> {
        let marketplace = SourceTarget::marketplace(
            self.config.marketplace_url(&product.name),
            self.config.marketplace_name.clone(),
        );
        let merchant_urls = match self.store.list_active_merchant_urls(&product.category).await {
            Ok(urls) => urls,
            Err(err) => {
                warn!(category = %product.category, error = %err, "could not read merchant urls");
                Vec::new()
            }
        };

        let listings = if self.config.batch_retailers && !merchant_urls.is_empty() {
            let (mut used, new) = tokio::join!(
                self.extract_one(&marketplace, ExtractOptions::marketplace()),
                self.extract_retailer_batch(&merchant_urls),
            );
            used.extend(new);
            used
        } else {
            let mut targets = vec![(marketplace, ExtractOptions::marketplace())];
            targets.extend(
                merchant_urls
                    .iter()
                    .map(|u| (retailer_target(u), ExtractOptions::default())),
            );
            let pending: Vec<_> = targets
                .iter()
                .map(|(target, options)| self.extract_one(target, options.clone()))
                .collect();
            stream::iter(pending)
                .buffered(self.config.source_concurrency.max(1))
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .flatten()
                .collect()
        };

        let now = Utc::now();
        for url in &merchant_urls {
            if let Err(err) = self.store.touch_merchant_url(url.id, now).await {
                warn!(url = %url.url, error = %err, "could not update merchant url");
            }
        }
        listings
    }

    async fn extract_one(&self, target: &SourceTarget, options: ExtractOptions) -> Vec<ScrapedListing> {
        match tokio::time::timeout(self.config.step_timeout, self.extractor.extract(target, &options)).await {
            Ok(listings) => listings,
            Err(_) => {
                warn!(url = %target.url, "extraction step timed out");
                Vec::new()
            }
        }
    }

    async fn extract_retailer_batch(&self, merchant_urls: &[MerchantUrl]) -> Vec<ScrapedListing> {
        let targets: Vec<_> = merchant_urls.iter().map(retailer_target).collect();
        let policy = BatchPolicy {
            poll_interval: self.config.batch_poll_interval,
            max_wait: self.config.batch_max_wait,
            fallback_concurrency: self.config.source_concurrency,
        };
        let options = ExtractOptions::default();
        // The batch bounds its own polling; this only catches a hung submit.
        let limit = self.config.batch_max_wait + self.config.step_timeout;
        match tokio::time::timeout(limit, self.extractor.extract_batch(&targets, &options, policy)).await {
            Ok(listings) => listings,
            Err(_) => {
                warn!(count = targets.len(), "retailer batch timed out");
                Vec::new()
            }
        }
    }

    /// Replaces the variant's listing set with this pass's group and rewrites
    /// its derived price fields.
    async fn persist_group(
        &self,
        product: &Product,
        group: &MatchedGroup,
        insights: &MarketInsights,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let listing_group_id = Uuid::new_v4();
        let bounds = self.config.price_bounds_for(&product.category);

        let rows: Vec<MerchantListing> = group
            .listings
            .iter()
            .map(|m| MerchantListing {
                id: Uuid::new_v4(),
                variant_id: group.variant_id,
                merchant_name: m.listing.merchant_name.clone(),
                price: m.listing.price,
                condition: m.listing.condition,
                url: m.listing.url.clone(),
                confidence: m.confidence,
                price_tier: m.tier,
                listing_group_id,
                market_insight: Some(insights.recommendation.clone()),
                is_valid: bounds.map_or(true, |b| b.contains(m.listing.price)),
                scraped_at: now,
            })
            .collect();
        let update = self.price_update(group, insights, now);
        self.store
            .persist_variant_pass(group.variant_id, &rows, &update)
            .await?;
        debug!(
            variant_id = %group.variant_id,
            listings = rows.len(),
            %listing_group_id,
            "variant listings replaced"
        );
        Ok(())
    }

    fn price_update(
        &self,
        group: &MatchedGroup,
        insights: &MarketInsights,
        now: DateTime<Utc>,
    ) -> VariantPriceUpdate {
        let new_prices: Vec<f64> = group
            .listings
            .iter()
            .filter(|m| m.listing.condition == Condition::New)
            .map(|m| m.listing.price)
            .collect();
        let used_count = group
            .listings
            .iter()
            .filter(|m| m.listing.condition == Condition::Used)
            .count();
        let confidences: Vec<f64> = group.listings.iter().map(|m| m.confidence).collect();

        let price_new = mean(&new_prices).map(f64::round);
        let new = price_new.map(|avg_price| NewPriceSummary {
            source: RETAILER_SOURCE.to_string(),
            avg_price,
            total_listings: new_prices.len(),
            merchants: group
                .listings
                .iter()
                .filter(|m| m.listing.condition == Condition::New)
                .map(|m| m.listing.merchant_name.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            updated_at: now,
        });
        let used = (used_count > 0).then(|| UsedPriceSummary {
            source: self.config.marketplace_name.clone(),
            tiers: group.tiers.clone(),
            total_listings: used_count,
            median_price: group.price_range.median,
            price_range: group.price_range,
            recommendation: insights.recommendation.clone(),
            updated_at: now,
        });

        VariantPriceUpdate {
            price_new,
            price_used: used.as_ref().map(|u| u.median_price),
            confidence: mean(&confidences).unwrap_or(0.0),
            price_data: PriceData {
                new,
                used,
                market_insights: insights.clone(),
            },
            updated_at: now,
        }
    }
}

fn retailer_target(url: &MerchantUrl) -> SourceTarget {
    SourceTarget::retailer(url.url.clone(), url.merchant_name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prisradar_core::{Budget, MerchantUrl, ProductVariant, QualityTier};
    use prisradar_extract::{ScrapeOptions, ScrapeService, ScrapeServiceError, ScrapedPage, BatchStatus};
    use prisradar_oracle::{OracleError, ScriptedOracle};
    use prisradar_storage::{BudgetAllocator, FetchError, FetchedPage, MemoryStore, PageFetcher};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FINN_MARKDOWN: &str = "\
# AirPods Pro til salgs
AirPods Pro som ny
1 800 kr
AirPods Pro god stand
1 500 kr
AirPods Pro defekt høyre øretelefon
600 kr";

    /// Serves fixed markdown per URL.
    #[derive(Default)]
    struct PageService {
        pages: HashMap<String, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScrapeService for PageService {
        async fn scrape(&self, url: &str, _options: &ScrapeOptions) -> Result<ScrapedPage, ScrapeServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let markdown = self.pages.get(url).cloned().unwrap_or_default();
            Ok(ScrapedPage {
                markdown: Some(markdown),
                ..ScrapedPage::default()
            })
        }

        async fn batch_scrape(&self, _urls: &[String], _options: &ScrapeOptions) -> Result<String, ScrapeServiceError> {
            Err(ScrapeServiceError::Api {
                status: 501,
                message: "no batches here".into(),
            })
        }

        async fn poll_batch(&self, _job_id: &str) -> Result<BatchStatus, ScrapeServiceError> {
            Ok(BatchStatus::default())
        }
    }

    struct NoFetch;

    #[async_trait]
    impl PageFetcher for NoFetch {
        async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        oracle: Arc<ScriptedOracle>,
        service: Arc<PageService>,
        pipeline: Pipeline,
        product: Product,
        variant: ProductVariant,
    }

    async fn fixture(pages: HashMap<String, String>, daily_budget: i32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let product = Product {
            id: Uuid::from_u128(1),
            name: "AirPods Pro".into(),
            category: "headphones".into(),
            priority_score: 50,
            scrape_frequency_hours: Some(24.0),
            last_scraped_at: None,
        };
        let variant = ProductVariant {
            id: Uuid::from_u128(11),
            product_id: product.id,
            storage_gb: None,
            color: Some("hvit".into()),
            model: Some("AirPods Pro 2".into()),
            price_new: None,
            price_used: None,
            confidence: None,
            price_data: None,
            updated_at: None,
        };
        store.insert_product(product.clone()).await;
        store.insert_variant(variant.clone()).await;

        let oracle = Arc::new(ScriptedOracle::new());
        let service = Arc::new(PageService {
            pages,
            ..PageService::default()
        });
        let allocator = Arc::new(BudgetAllocator::new(store.clone(), daily_budget));
        let extractor = Arc::new(ListingExtractor::new(
            allocator,
            Some(service.clone() as Arc<dyn ScrapeService>),
            Arc::new(NoFetch),
        ));
        let pipeline = Pipeline::new(
            store.clone(),
            extractor,
            Matcher::new(oracle.clone()),
            PipelineConfig::default(),
        );
        Fixture {
            store,
            oracle,
            service,
            pipeline,
            product,
            variant,
        }
    }

    fn finn_url() -> String {
        PipelineConfig::default().marketplace_url("AirPods Pro")
    }

    fn match_answer(variant_id: Uuid, entries: &[(usize, f64, &str, &str, f64)]) -> serde_json::Value {
        let listings: Vec<_> = entries
            .iter()
            .map(|(index, confidence, tier, title, price)| {
                json!({
                    "listing_index": index,
                    "confidence": confidence,
                    "condition_quality": tier,
                    "price": price,
                    "url": "",
                    "title": title,
                })
            })
            .collect();
        json!({
            "matched_listings": [{
                "variant_id": variant_id.to_string(),
                "listings": listings,
                "price_range": { "min": 0.0, "max": 0.0, "median": 0.0 },
                "quality_tiers": [],
            }],
            "unmatched_listings": [],
            "market_insights": {
                "summary": "Jevn tilgang på brukte AirPods Pro.",
                "price_trend": "stable",
                "best_value_tier": "good",
                "recommendation": "Kjøp en i god stand.",
            }
        })
    }

    #[tokio::test]
    async fn airpods_pass_persists_tiered_used_prices() {
        let f = fixture(HashMap::from([(finn_url(), FINN_MARKDOWN.to_string())]), 133).await;
        f.oracle
            .push(
                "listing_match",
                Ok(match_answer(
                    f.variant.id,
                    &[
                        (0, 0.93, "excellent", "AirPods Pro som ny", 1800.0),
                        (1, 0.9, "good", "AirPods Pro god stand", 1500.0),
                        (2, 0.85, "poor", "AirPods Pro defekt høyre øretelefon", 600.0),
                    ],
                )),
            )
            .await;

        let summary = f.pipeline.run(RunOptions::default()).await.unwrap();

        assert_eq!(summary.products_total, 1);
        assert_eq!(summary.products_processed, 1);
        assert_eq!(summary.variants_updated, 1);
        assert_eq!(summary.listings_scraped, 3);
        assert!(!summary.timed_out);
        assert!(!summary.budget_exhausted);

        let variant = f.store.variant(f.variant.id).await.unwrap();
        assert_eq!(variant.price_used, Some(1500.0));
        assert_eq!(variant.price_new, None);
        let used = variant.price_data.unwrap().used.unwrap();
        assert_eq!((used.price_range.min, used.price_range.max, used.price_range.median), (600.0, 1800.0, 1500.0));
        assert_eq!(used.tiers.len(), 3);
        assert!(used.tiers.values().all(|t| t.count == 1));
        assert_eq!(used.tiers[&QualityTier::Poor].max, 600.0);

        let rows = f.store.list_variant_listings(f.variant.id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.listing_group_id == rows[0].listing_group_id));
        assert!(rows.iter().all(|r| r.is_valid));

        let product = f.store.product(f.product.id).await.unwrap();
        assert!(product.last_scraped_at.is_some());
    }

    #[tokio::test]
    async fn second_pass_fully_replaces_the_listing_set() {
        let f = fixture(HashMap::from([(finn_url(), FINN_MARKDOWN.to_string())]), 133).await;
        f.oracle
            .push(
                "listing_match",
                Ok(match_answer(
                    f.variant.id,
                    &[
                        (0, 0.93, "excellent", "AirPods Pro som ny", 1800.0),
                        (1, 0.9, "good", "AirPods Pro god stand", 1500.0),
                        (2, 0.85, "poor", "AirPods Pro defekt høyre øretelefon", 600.0),
                    ],
                )),
            )
            .await;
        f.oracle
            .push(
                "listing_match",
                Ok(match_answer(f.variant.id, &[(1, 0.9, "good", "AirPods Pro god stand", 1500.0)])),
            )
            .await;

        f.pipeline.run(RunOptions::default()).await.unwrap();
        let first = f.store.list_variant_listings(f.variant.id).await.unwrap();
        f.pipeline.run(RunOptions { force: true }).await.unwrap();
        let second = f.store.list_variant_listings(f.variant.id).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].listing_group_id, first[0].listing_group_id);
        assert_eq!(f.store.variant(f.variant.id).await.unwrap().price_used, Some(1500.0));
    }

    #[tokio::test]
    async fn recently_scraped_products_are_skipped_unless_forced() {
        let f = fixture(HashMap::new(), 133).await;
        f.store
            .touch_product(f.product.id, Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();

        let summary = f.pipeline.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.products_skipped, 1);
        assert_eq!(summary.results[0].status, ProductStatus::NotDue);
        assert_eq!(f.service.calls.load(Ordering::SeqCst), 0);

        let forced = f.pipeline.run(RunOptions { force: true }).await.unwrap();
        assert_eq!(forced.products_processed, 1);
        assert_eq!(f.service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oracle_failure_skips_persistence_for_that_product_only() {
        let f = fixture(HashMap::from([(finn_url(), FINN_MARKDOWN.to_string())]), 133).await;
        let other = Product {
            id: Uuid::from_u128(2),
            name: "Galaxy S24".into(),
            category: "smartphone".into(),
            priority_score: 10,
            scrape_frequency_hours: None,
            last_scraped_at: None,
        };
        f.store.insert_product(other.clone()).await;
        f.store
            .insert_variant(ProductVariant {
                id: Uuid::from_u128(22),
                product_id: other.id,
                ..f.variant.clone()
            })
            .await;
        f.store
            .insert_merchant_url(MerchantUrl {
                id: Uuid::from_u128(33),
                category: "smartphone".into(),
                merchant_name: "Elkjøp".into(),
                url: "https://www.elkjop.no/mobil".into(),
                active: true,
                last_scraped_at: None,
            })
            .await;
        f.oracle.push("listing_match", Err(OracleError::Timeout)).await;

        let summary = f.pipeline.run(RunOptions::default()).await.unwrap();

        assert_eq!(summary.products_failed, 1);
        assert_eq!(summary.results.iter().find(|r| r.product_id == f.product.id).unwrap().status, ProductStatus::Failed);
        assert!(f.store.list_variant_listings(f.variant.id).await.unwrap().is_empty());
        assert!(f.store.variant(f.variant.id).await.unwrap().price_data.is_none());
        let galaxy = summary.results.iter().find(|r| r.product_id == other.id).unwrap();
        assert_eq!(galaxy.status, ProductStatus::Processed);
        let touched = f.store.merchant_urls().await;
        assert!(touched[0].last_scraped_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_budget_completes_gracefully() {
        let f = fixture(HashMap::from([(finn_url(), FINN_MARKDOWN.to_string())]), 100).await;
        let other = Product {
            id: Uuid::from_u128(2),
            name: "Galaxy S24".into(),
            ..f.product.clone()
        };
        f.store.insert_product(other.clone()).await;
        f.store
            .insert_variant(ProductVariant {
                id: Uuid::from_u128(21),
                product_id: other.id,
                ..f.variant.clone()
            })
            .await;
        f.store
            .put_budget(Budget {
                date: Utc::now().date_naive(),
                total: 100,
                used: 100,
                remaining: 0,
            })
            .await;

        let summary = f.pipeline.run(RunOptions::default()).await.unwrap();

        assert_eq!(summary.listings_scraped, 0);
        assert_eq!(summary.products_processed, 0);
        assert_eq!(summary.products_budget_skipped, 2);
        assert!(summary.budget_exhausted);
        assert!(summary
            .results
            .iter()
            .all(|r| r.status == ProductStatus::BudgetExhausted));
        assert_eq!(f.service.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.oracle.call_count().await, 0);
        // Left due so tomorrow's run picks them up.
        assert!(f.store.product(f.product.id).await.unwrap().last_scraped_at.is_none());
        assert!(f.store.product(other.id).await.unwrap().last_scraped_at.is_none());
    }

    #[tokio::test]
    async fn products_without_variants_are_not_touched() {
        let f = fixture(HashMap::new(), 133).await;
        let bare = Product {
            id: Uuid::from_u128(3),
            name: "Ukjent".into(),
            category: "misc".into(),
            priority_score: 99,
            scrape_frequency_hours: None,
            last_scraped_at: None,
        };
        f.store.insert_product(bare.clone()).await;

        let summary = f.pipeline.run(RunOptions::default()).await.unwrap();

        assert_eq!(summary.results[0].product_id, bare.id);
        assert_eq!(summary.results[0].status, ProductStatus::NoVariants);
        assert!(f.store.product(bare.id).await.unwrap().last_scraped_at.is_none());
    }

    #[tokio::test]
    async fn mixed_sources_write_new_and_used_prices_with_validity_flags() {
        let galaxy_finn = PipelineConfig::default().marketplace_url("Galaxy S24");
        let f = fixture(
            HashMap::from([
                (galaxy_finn, "Samsung Galaxy S24 128GB brukt\n1 500 kr".to_string()),
                ("https://www.elkjop.no/mobil".to_string(), "Samsung Galaxy S24 128GB\n9 990 kr".to_string()),
                ("https://www.power.no/mobil".to_string(), "Samsung Galaxy S24 128GB svart\n10 489 kr".to_string()),
            ]),
            133,
        )
        .await;
        f.store.touch_product(f.product.id, Utc::now()).await.unwrap();
        let galaxy = Product {
            id: Uuid::from_u128(2),
            name: "Galaxy S24".into(),
            category: "smartphone".into(),
            priority_score: 10,
            scrape_frequency_hours: None,
            last_scraped_at: None,
        };
        let variant_id = Uuid::from_u128(22);
        f.store.insert_product(galaxy.clone()).await;
        f.store
            .insert_variant(ProductVariant {
                id: variant_id,
                product_id: galaxy.id,
                storage_gb: Some(128),
                ..f.variant.clone()
            })
            .await;
        for (n, (merchant, url)) in [("Elkjøp", "https://www.elkjop.no/mobil"), ("Power", "https://www.power.no/mobil")]
            .into_iter()
            .enumerate()
        {
            f.store
                .insert_merchant_url(MerchantUrl {
                    id: Uuid::from_u128(40 + n as u128),
                    category: "smartphone".into(),
                    merchant_name: merchant.into(),
                    url: url.into(),
                    active: true,
                    last_scraped_at: None,
                })
                .await;
        }
        f.oracle
            .push(
                "listing_match",
                Ok(match_answer(
                    variant_id,
                    &[
                        (0, 0.8, "good", "Samsung Galaxy S24 128GB brukt", 1500.0),
                        (1, 0.95, "excellent", "Samsung Galaxy S24 128GB", 9990.0),
                        (2, 0.95, "excellent", "Samsung Galaxy S24 128GB svart", 10489.0),
                    ],
                )),
            )
            .await;

        let summary = f.pipeline.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.listings_scraped, 3);
        assert_eq!(summary.variants_updated, 1);

        let variant = f.store.variant(variant_id).await.unwrap();
        assert_eq!(variant.price_new, Some(10240.0));
        assert_eq!(variant.price_used, Some(1500.0));
        let new = variant.price_data.unwrap().new.unwrap();
        assert_eq!(new.merchants, vec!["Elkjøp".to_string(), "Power".to_string()]);
        assert_eq!(new.total_listings, 2);

        let rows = f.store.list_variant_listings(variant_id).await.unwrap();
        let invalid: Vec<f64> = rows.iter().filter(|r| !r.is_valid).map(|r| r.price).collect();
        assert_eq!(invalid, vec![1500.0]);
        assert!(rows
            .iter()
            .filter(|r| r.condition == Condition::New)
            .all(|r| r.price_tier == QualityTier::Excellent));
    }
}
