//! Postgres-backed `Store` using runtime-checked `sqlx` queries.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use prisradar_core::{
    AiJob, Budget, CacheEntry, Condition, JobResult, JobStatus, JobTask, MerchantListing,
    MerchantUrl, NormalizedOffer, PriceData, Product, ProductAttribute, ProductVariant,
    QualityTier, VariantPriceUpdate,
};
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::Transaction;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn job_status(&self, id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM ai_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_status(&r)).transpose()
    }

    async fn transition_error(&self, id: Uuid, to: JobStatus) -> StoreError {
        match self.job_status(id).await {
            Ok(Some(from)) => StoreError::InvalidTransition { id, from, to },
            Ok(None) => StoreError::not_found("job", id),
            Err(err) => err,
        }
    }
}

const JOB_COLUMNS: &str =
    "id, kind, payload, cache_key, status, error, result, created_at, updated_at, processed_at";

fn corrupt(column: &'static str, message: impl ToString) -> StoreError {
    StoreError::Corrupt {
        column,
        message: message.to_string(),
    }
}

fn parse_status(row: &PgRow) -> Result<JobStatus, StoreError> {
    let raw: String = row.try_get("status")?;
    JobStatus::parse(&raw).ok_or_else(|| corrupt("ai_jobs.status", raw))
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        priority_score: row.try_get("priority_score")?,
        scrape_frequency_hours: row.try_get("scrape_frequency_hours")?,
        last_scraped_at: row.try_get("last_scraped_at")?,
    })
}

fn variant_from_row(row: &PgRow) -> Result<ProductVariant, StoreError> {
    let price_data: Option<serde_json::Value> = row.try_get("price_data")?;
    let price_data = price_data
        .map(serde_json::from_value::<PriceData>)
        .transpose()
        .map_err(|e| corrupt("product_variants.price_data", e))?;
    Ok(ProductVariant {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        storage_gb: row.try_get("storage_gb")?,
        color: row.try_get("color")?,
        model: row.try_get("model")?,
        price_new: row.try_get("price_new")?,
        price_used: row.try_get("price_used")?,
        confidence: row.try_get("confidence")?,
        price_data,
        updated_at: row.try_get("updated_at")?,
    })
}

fn merchant_url_from_row(row: &PgRow) -> Result<MerchantUrl, StoreError> {
    Ok(MerchantUrl {
        id: row.try_get("id")?,
        category: row.try_get("category")?,
        merchant_name: row.try_get("merchant_name")?,
        url: row.try_get("url")?,
        active: row.try_get("active")?,
        last_scraped_at: row.try_get("last_scraped_at")?,
    })
}

async fn replace_listings(
    tx: &mut Transaction<'_, Postgres>,
    variant_id: Uuid,
    listings: &[MerchantListing],
) -> Result<u64, StoreError> {
    let deleted = sqlx::query("DELETE FROM merchant_listings WHERE variant_id = $1")
        .bind(variant_id)
        .execute(&mut **tx)
        .await?;
    for listing in listings {
        sqlx::query(
            r#"
            INSERT INTO merchant_listings
                (id, variant_id, merchant_name, price, condition, url, confidence,
                 price_tier, listing_group_id, market_insight, is_valid, scraped_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(listing.id)
        .bind(variant_id)
        .bind(&listing.merchant_name)
        .bind(listing.price)
        .bind(listing.condition.as_str())
        .bind(&listing.url)
        .bind(listing.confidence)
        .bind(listing.price_tier.as_str())
        .bind(listing.listing_group_id)
        .bind(&listing.market_insight)
        .bind(listing.is_valid)
        .bind(listing.scraped_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(deleted.rows_affected())
}

fn listing_from_row(row: &PgRow) -> Result<MerchantListing, StoreError> {
    let condition: String = row.try_get("condition")?;
    let tier: String = row.try_get("price_tier")?;
    Ok(MerchantListing {
        id: row.try_get("id")?,
        variant_id: row.try_get("variant_id")?,
        merchant_name: row.try_get("merchant_name")?,
        price: row.try_get("price")?,
        condition: condition
            .parse::<Condition>()
            .map_err(|e| corrupt("merchant_listings.condition", e))?,
        url: row.try_get("url")?,
        confidence: row.try_get("confidence")?,
        price_tier: tier
            .parse::<QualityTier>()
            .map_err(|e| corrupt("merchant_listings.price_tier", e))?,
        listing_group_id: row.try_get("listing_group_id")?,
        market_insight: row.try_get("market_insight")?,
        is_valid: row.try_get("is_valid")?,
        scraped_at: row.try_get("scraped_at")?,
    })
}

fn budget_from_row(row: &PgRow) -> Result<Budget, StoreError> {
    Ok(Budget {
        date: row.try_get("date")?,
        total: row.try_get("budget_total")?,
        used: row.try_get("budget_used")?,
        remaining: row.try_get("budget_remaining")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<AiJob, StoreError> {
    let kind: String = row.try_get("kind")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let task: JobTask = serde_json::from_value(json!({ "kind": kind, "payload": payload }))
        .map_err(|e| corrupt("ai_jobs.payload", e))?;
    let result: Option<serde_json::Value> = row.try_get("result")?;
    let result = result
        .map(serde_json::from_value::<JobResult>)
        .transpose()
        .map_err(|e| corrupt("ai_jobs.result", e))?;
    Ok(AiJob {
        id: row.try_get("id")?,
        task,
        cache_key: row.try_get("cache_key")?,
        status: parse_status(row)?,
        error: row.try_get("error")?,
        result,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn cache_from_row(row: &PgRow) -> Result<CacheEntry, StoreError> {
    let result: serde_json::Value = row.try_get("result")?;
    Ok(CacheEntry {
        cache_key: row.try_get("cache_key")?,
        result: serde_json::from_value(result).map_err(|e| corrupt("ai_cache.result", e))?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn task_payload(task: &JobTask) -> Result<serde_json::Value, StoreError> {
    let mut value = serde_json::to_value(task)?;
    Ok(value
        .get_mut("payload")
        .map(serde_json::Value::take)
        .unwrap_or(serde_json::Value::Null))
}

#[async_trait]
impl Store for PgStore {
    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, category, priority_score, scrape_frequency_hours, last_scraped_at
              FROM products
             ORDER BY priority_score DESC, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(product_from_row).collect()
    }

    async fn list_variants(&self, product_id: Uuid) -> Result<Vec<ProductVariant>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, storage_gb, color, model, price_new, price_used,
                   confidence, price_data, updated_at
              FROM product_variants
             WHERE product_id = $1
             ORDER BY storage_gb NULLS LAST, color
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(variant_from_row).collect()
    }

    async fn list_active_merchant_urls(&self, category: &str) -> Result<Vec<MerchantUrl>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, category, merchant_name, url, active, last_scraped_at
              FROM merchant_urls
             WHERE category = $1 AND active
             ORDER BY merchant_name
            "#,
        )
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(merchant_url_from_row).collect()
    }

    async fn touch_product(&self, product_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE products SET last_scraped_at = $2 WHERE id = $1")
            .bind(product_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("product", product_id));
        }
        Ok(())
    }

    async fn touch_merchant_url(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE merchant_urls SET last_scraped_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_product_schedule(
        &self,
        product_id: Uuid,
        priority_score: i32,
        scrape_frequency_hours: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE products SET priority_score = $2, scrape_frequency_hours = $3 WHERE id = $1",
        )
        .bind(product_id)
        .bind(priority_score)
        .bind(scrape_frequency_hours)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_variant_listings(
        &self,
        variant_id: Uuid,
        listings: &[MerchantListing],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = replace_listings(&mut tx, variant_id, listings).await?;
        tx.commit().await?;
        debug!(%variant_id, deleted, inserted = listings.len(), "replaced variant listings");
        Ok(())
    }

    async fn list_variant_listings(&self, variant_id: Uuid) -> Result<Vec<MerchantListing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, variant_id, merchant_name, price, condition, url, confidence,
                   price_tier, listing_group_id, market_insight, is_valid, scraped_at
              FROM merchant_listings
             WHERE variant_id = $1
             ORDER BY price
            "#,
        )
        .bind(variant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn persist_variant_pass(
        &self,
        variant_id: Uuid,
        listings: &[MerchantListing],
        update: &VariantPriceUpdate,
    ) -> Result<(), StoreError> {
        let price_data = serde_json::to_value(&update.price_data)?;
        let mut tx = self.pool.begin().await?;
        // Row lock on the variant first; a vanished variant rolls back before any delete.
        let done = sqlx::query(
            r#"
            UPDATE product_variants
               SET price_new = $2, price_used = $3, confidence = $4, price_data = $5, updated_at = $6
             WHERE id = $1
            "#,
        )
        .bind(variant_id)
        .bind(update.price_new)
        .bind(update.price_used)
        .bind(update.confidence)
        .bind(price_data)
        .bind(update.updated_at)
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("variant", variant_id));
        }
        let deleted = replace_listings(&mut tx, variant_id, listings).await?;
        tx.commit().await?;
        debug!(%variant_id, deleted, inserted = listings.len(), "persisted variant pass");
        Ok(())
    }

    async fn product_listing_confidences(
        &self,
        product_id: Uuid,
        limit: usize,
    ) -> Result<Vec<f64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT ml.confidence
              FROM merchant_listings ml
              JOIN product_variants pv ON pv.id = ml.variant_id
             WHERE pv.product_id = $1
             ORDER BY ml.scraped_at DESC
             LIMIT $2
            "#,
        )
        .bind(product_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<f64, _>("confidence").map_err(StoreError::from))
            .collect()
    }

    async fn get_or_create_budget(&self, date: NaiveDate, total: i32) -> Result<Budget, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_budget (date, budget_total, budget_used, budget_remaining)
            VALUES ($1, $2, 0, $2)
            ON CONFLICT (date) DO NOTHING
            "#,
        )
        .bind(date)
        .bind(total)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query(
            "SELECT date, budget_total, budget_used, budget_remaining FROM scrape_budget WHERE date = $1",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        budget_from_row(&row)
    }

    async fn try_spend_budget(&self, date: NaiveDate, amount: i32) -> Result<Option<Budget>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE scrape_budget
               SET budget_used = budget_used + $2,
                   budget_remaining = budget_remaining - $2
             WHERE date = $1 AND budget_remaining >= $2
            RETURNING date, budget_total, budget_used, budget_remaining
            "#,
        )
        .bind(date)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(budget_from_row).transpose()
    }

    async fn reset_budget(&self, date: NaiveDate, total: i32) -> Result<Budget, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO scrape_budget (date, budget_total, budget_used, budget_remaining)
            VALUES ($1, $2, 0, $2)
            ON CONFLICT (date) DO UPDATE
               SET budget_total = EXCLUDED.budget_total,
                   budget_used = 0,
                   budget_remaining = EXCLUDED.budget_remaining
            RETURNING date, budget_total, budget_used, budget_remaining
            "#,
        )
        .bind(date)
        .bind(total)
        .fetch_one(&self.pool)
        .await?;
        budget_from_row(&row)
    }

    async fn insert_job(&self, job: &AiJob) -> Result<(), StoreError> {
        let result = job.result.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO ai_jobs
                (id, kind, payload, cache_key, status, error, result, created_at, updated_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(job.kind().as_str())
        .bind(task_payload(&job.task)?)
        .bind(&job.cache_key)
        .bind(job.status.as_str())
        .bind(&job.error)
        .bind(result)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<AiJob>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM ai_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_pending_jobs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<AiJob>, StoreError> {
        let query = format!(
            "UPDATE ai_jobs \
             SET status = 'processing', updated_at = $2 \
             WHERE id IN ( \
                 SELECT id FROM ai_jobs \
                 WHERE status = 'pending' \
                 ORDER BY created_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn requeue_stale_jobs(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let requeued = sqlx::query(
            r#"
            UPDATE ai_jobs
               SET status = 'pending', updated_at = $2
             WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(requeued.rows_affected() as usize)
    }

    async fn complete_job(&self, id: Uuid, result: &JobResult, now: DateTime<Utc>) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE ai_jobs
               SET status = 'completed', result = $2, updated_at = $3, processed_at = $3
             WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(serde_json::to_value(result)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(self.transition_error(id, JobStatus::Completed).await);
        }
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE ai_jobs
               SET status = 'failed', error = $2, updated_at = $3
             WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(self.transition_error(id, JobStatus::Failed).await);
        }
        Ok(())
    }

    async fn get_cache_entry(&self, cache_key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT cache_key, result, created_at, expires_at
              FROM ai_cache
             WHERE cache_key = $1 AND expires_at > $2
            "#,
        )
        .bind(cache_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(cache_from_row).transpose()
    }

    async fn put_cache_entry_if_absent(
        &self,
        entry: &CacheEntry,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ai_cache (cache_key, result, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (cache_key) DO UPDATE
               SET result = EXCLUDED.result,
                   created_at = EXCLUDED.created_at,
                   expires_at = EXCLUDED.expires_at
             WHERE ai_cache.expires_at <= $5
            "#,
        )
        .bind(&entry.cache_key)
        .bind(serde_json::to_value(&entry.result)?)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query(
            "SELECT cache_key, result, created_at, expires_at FROM ai_cache WHERE cache_key = $1",
        )
        .bind(&entry.cache_key)
        .fetch_one(&self.pool)
        .await?;
        cache_from_row(&row)
    }

    async fn insert_normalized_offer(&self, offer: &NormalizedOffer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO normalized_offers
                (id, merchant_offer_id, normalized_product_id, confidence, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(offer.id)
        .bind(offer.merchant_offer_id)
        .bind(offer.normalized_product_id)
        .bind(offer.confidence)
        .bind(&offer.reason)
        .bind(offer.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_product_attributes(&self, attributes: &[ProductAttribute]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for attribute in attributes {
            sqlx::query(
                r#"
                INSERT INTO product_attributes (product_id, attribute_key, attribute_value, source)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (product_id, attribute_key, source)
                DO UPDATE SET attribute_value = EXCLUDED.attribute_value
                "#,
            )
            .bind(attribute.product_id)
            .bind(&attribute.attribute_key)
            .bind(&attribute.attribute_value)
            .bind(&attribute.source)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
