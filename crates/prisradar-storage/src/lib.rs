//! Persistence interface, budget admission control and direct HTTP fetching
//! for prisradar.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use prisradar_core::{
    AiJob, Budget, CacheEntry, JobResult, JobStatus, MerchantListing, MerchantUrl,
    NormalizedOffer, Product, ProductAttribute, ProductVariant, VariantPriceUpdate,
};
use thiserror::Error;
use uuid::Uuid;

pub mod budget;
pub mod http;
pub mod memory;
pub mod postgres;

pub use budget::{
    AdmissionAction, AdmissionRequest, AdmissionResponse, Allocation, BudgetAllocator, BudgetError,
    DEFAULT_DAILY_BUDGET,
};
pub use http::{
    is_transient, FetchError, FetchedPage, HttpClientConfig, HttpFetcher, PageFetcher, RetryPolicy,
    BROWSER_USER_AGENT,
};
pub use memory::{CatalogSeed, MemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "prisradar-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("corrupt {column} value: {message}")]
    Corrupt {
        column: &'static str,
        message: String,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Narrow persistence interface over the catalog, listings, budget and job tables.
///
/// Every operation is a filtered read, a batch insert, a keyed delete or a
/// keyed update. Implementations must make `replace_variant_listings`,
/// `persist_variant_pass`, `try_spend_budget`, `claim_pending_jobs`,
/// `requeue_stale_jobs` and `put_cache_entry_if_absent` atomic.
#[async_trait]
pub trait Store: Send + Sync {
    /// Products ordered by descending `priority_score`.
    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;
    async fn list_variants(&self, product_id: Uuid) -> Result<Vec<ProductVariant>, StoreError>;
    async fn list_active_merchant_urls(&self, category: &str) -> Result<Vec<MerchantUrl>, StoreError>;
    async fn touch_product(&self, product_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn touch_merchant_url(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn update_product_schedule(
        &self,
        product_id: Uuid,
        priority_score: i32,
        scrape_frequency_hours: f64,
    ) -> Result<(), StoreError>;

    /// Deletes every listing of the variant and inserts `listings` in one unit.
    async fn replace_variant_listings(
        &self,
        variant_id: Uuid,
        listings: &[MerchantListing],
    ) -> Result<(), StoreError>;
    async fn list_variant_listings(&self, variant_id: Uuid) -> Result<Vec<MerchantListing>, StoreError>;
    /// Replaces the variant's listings and rewrites its derived price fields
    /// as one unit. A missing variant fails the whole pass and leaves the
    /// previous listings in place.
    async fn persist_variant_pass(
        &self,
        variant_id: Uuid,
        listings: &[MerchantListing],
        update: &VariantPriceUpdate,
    ) -> Result<(), StoreError>;
    async fn product_listing_confidences(
        &self,
        product_id: Uuid,
        limit: usize,
    ) -> Result<Vec<f64>, StoreError>;

    async fn get_or_create_budget(&self, date: NaiveDate, total: i32) -> Result<Budget, StoreError>;
    /// Conditionally spends `amount`; `None` when the day's remainder is too small.
    async fn try_spend_budget(&self, date: NaiveDate, amount: i32) -> Result<Option<Budget>, StoreError>;
    async fn reset_budget(&self, date: NaiveDate, total: i32) -> Result<Budget, StoreError>;

    async fn insert_job(&self, job: &AiJob) -> Result<(), StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<AiJob>, StoreError>;
    /// Takes up to `limit` oldest pending jobs and marks them processing.
    async fn claim_pending_jobs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<AiJob>, StoreError>;
    /// Returns processing jobs last touched before `cutoff` to pending, for
    /// workers that died mid-job. Yields the number requeued.
    async fn requeue_stale_jobs(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize, StoreError>;
    async fn complete_job(&self, id: Uuid, result: &JobResult, now: DateTime<Utc>) -> Result<(), StoreError>;
    async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn get_cache_entry(&self, cache_key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, StoreError>;
    /// Stores `entry` unless a live entry for the key exists; returns whichever entry is stored.
    async fn put_cache_entry_if_absent(
        &self,
        entry: &CacheEntry,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, StoreError>;

    async fn insert_normalized_offer(&self, offer: &NormalizedOffer) -> Result<(), StoreError>;
    async fn insert_product_attributes(&self, attributes: &[ProductAttribute]) -> Result<(), StoreError>;
}
