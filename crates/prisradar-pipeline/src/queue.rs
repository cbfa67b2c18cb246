//! Cached AI job queue: `pending -> processing -> completed | failed`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use prisradar_core::{
    cache_key_for, AiJob, AlertEmail, AlertEmailPayload, AttributeSet, CacheEntry,
    ExtractAttributesPayload, JobKind, JobResult, JobTask, NormalizeOfferPayload, NormalizedOffer,
    OfferMatch, ProductAttribute,
};
use prisradar_oracle::{extract, Oracle, OracleError};
use prisradar_storage::{Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const ATTRIBUTE_SOURCE: &str = "ai";

/// A processing job untouched for this long belonged to a worker that died.
pub const STALE_JOB_AFTER: chrono::Duration = chrono::Duration::minutes(10);

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not encode job input: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid oracle result: {0}")]
    InvalidResult(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Jobs that completed.
    pub processed: usize,
    /// Jobs claimed in this drain.
    pub total: usize,
    pub results: Vec<JobReport>,
}

pub struct JobQueue {
    store: Arc<dyn Store>,
    oracle: Arc<dyn Oracle>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    stale_after: chrono::Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>, oracle: Arc<dyn Oracle>) -> Self {
        Self {
            store,
            oracle,
            key_locks: Mutex::new(HashMap::new()),
            stale_after: STALE_JOB_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub async fn enqueue(&self, task: JobTask, cache_key: Option<String>) -> Result<AiJob, JobError> {
        let job = AiJob::pending(task, cache_key, Utc::now());
        self.store.insert_job(&job).await?;
        debug!(job_id = %job.id, kind = %job.kind(), "job enqueued");
        Ok(job)
    }

    /// Enqueues with the task's derived cache key.
    pub async fn enqueue_cached(&self, task: JobTask) -> Result<AiJob, JobError> {
        let key = cache_key_for(&task)?;
        self.enqueue(task, Some(key)).await
    }

    /// Runs up to `limit` pending jobs to a terminal state, claiming one at a
    /// time so a crash strands at most the job in hand. Jobs stuck in
    /// processing longer than the stale timeout are requeued first. A failing
    /// job is recorded and the rest of the batch continues.
    pub async fn drain(&self, limit: usize) -> Result<DrainReport, JobError> {
        let now = Utc::now();
        let requeued = self.store.requeue_stale_jobs(now - self.stale_after, now).await?;
        if requeued > 0 {
            warn!(requeued, "requeued jobs abandoned in processing");
        }

        let mut report = DrainReport::default();
        while report.total < limit {
            let Some(job) = self.store.claim_pending_jobs(1, Utc::now()).await?.pop() else {
                break;
            };
            report.total += 1;
            let span = info_span!("ai_job", job_id = %job.id, kind = %job.kind());
            let entry = self.run_job(&job).instrument(span).await;
            if entry.error.is_none() {
                report.processed += 1;
            }
            report.results.push(entry);
        }

        if report.total > 0 {
            info!(processed = report.processed, total = report.total, "job queue drained");
        }
        Ok(report)
    }

    async fn run_job(&self, job: &AiJob) -> JobReport {
        let mut entry = JobReport {
            job_id: job.id,
            kind: job.kind(),
            cached: false,
            error: None,
        };
        let outcome = match self.resolve(job).await {
            Ok((result, cached)) => {
                entry.cached = cached;
                match self.apply_side_effects(job, &result).await {
                    Ok(()) => self
                        .store
                        .complete_job(job.id, &result, Utc::now())
                        .await
                        .map_err(JobError::from),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };

        if let Err(err) = outcome {
            let message = err.to_string();
            warn!(error = %message, "job failed");
            if let Err(store_err) = self.store.fail_job(job.id, &message, Utc::now()).await {
                warn!(error = %store_err, "could not record job failure");
            }
            entry.error = Some(message);
        }
        entry
    }

    /// The job's result and whether it came from the cache. At most one
    /// computation per live cache key.
    async fn resolve(&self, job: &AiJob) -> Result<(JobResult, bool), JobError> {
        let Some(key) = job.cache_key.as_deref() else {
            return Ok((self.compute(&job.task).await?, false));
        };

        let lock = self.key_lock(key).await;
        let resolved = {
            let _guard = lock.lock().await;
            self.resolve_cached(key, &job.task).await
        };
        drop(lock);
        self.release_key_lock(key).await;
        resolved
    }

    async fn resolve_cached(&self, key: &str, task: &JobTask) -> Result<(JobResult, bool), JobError> {
        if let Some(hit) = self.store.get_cache_entry(key, Utc::now()).await? {
            if hit.result.kind() == task.kind() {
                debug!(cache_key = key, "cache hit");
                return Ok((hit.result, true));
            }
            warn!(cache_key = key, "cached result has a different kind, recomputing");
        }

        let computed = self.compute(task).await?;
        let now = Utc::now();
        let stored = self
            .store
            .put_cache_entry_if_absent(&CacheEntry::new(key, computed.clone(), now), now)
            .await?;
        // Another process may have won the insert; its result is authoritative.
        let cached = stored.result != computed;
        Ok((stored.result, cached))
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    async fn release_key_lock(&self, key: &str) {
        let mut locks = self.key_locks.lock().await;
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    async fn compute(&self, task: &JobTask) -> Result<JobResult, JobError> {
        let oracle = self.oracle.as_ref();
        match task {
            JobTask::NormalizeOffer(payload) => {
                let answer: OfferMatch =
                    extract(oracle, "offer_match", OFFER_SYSTEM_PROMPT, offer_instruction(payload)?).await?;
                validate_offer(&answer, payload)?;
                Ok(JobResult::NormalizeOffer(answer))
            }
            JobTask::ExtractAttributes(payload) => {
                let answer: AttributeSet = extract(
                    oracle,
                    "product_attributes",
                    ATTRIBUTES_SYSTEM_PROMPT,
                    attributes_instruction(payload),
                )
                .await?;
                Ok(JobResult::ExtractAttributes(answer))
            }
            JobTask::WriteAlertEmail(payload) => {
                let answer: AlertEmail =
                    extract(oracle, "alert_email", ALERT_SYSTEM_PROMPT, alert_instruction(payload)).await?;
                Ok(JobResult::WriteAlertEmail(answer))
            }
        }
    }

    async fn apply_side_effects(&self, job: &AiJob, result: &JobResult) -> Result<(), JobError> {
        match (&job.task, result) {
            (JobTask::NormalizeOffer(payload), JobResult::NormalizeOffer(answer)) => {
                let Some(product_id) = matched_candidate(answer, payload) else {
                    return Ok(());
                };
                self.store
                    .insert_normalized_offer(&NormalizedOffer {
                        id: Uuid::new_v4(),
                        merchant_offer_id: payload.merchant_offer_id,
                        normalized_product_id: product_id,
                        confidence: answer.confidence,
                        reason: answer.reason.clone(),
                        created_at: Utc::now(),
                    })
                    .await?;
            }
            (JobTask::ExtractAttributes(payload), JobResult::ExtractAttributes(set)) => {
                let rows: Vec<ProductAttribute> = set
                    .attributes
                    .iter()
                    .filter(|a| !a.key.trim().is_empty() && !a.value.trim().is_empty())
                    .map(|a| ProductAttribute {
                        product_id: payload.product_id,
                        attribute_key: a.key.trim().to_lowercase(),
                        attribute_value: a.value.trim().to_string(),
                        source: ATTRIBUTE_SOURCE.to_string(),
                    })
                    .collect();
                if !rows.is_empty() {
                    self.store.insert_product_attributes(&rows).await?;
                }
            }
            (JobTask::WriteAlertEmail(_), JobResult::WriteAlertEmail(_)) => {}
            (task, result) => {
                return Err(JobError::InvalidResult(format!(
                    "{} result for a {} job",
                    result.kind(),
                    task.kind()
                )))
            }
        }
        Ok(())
    }
}

const OFFER_SYSTEM_PROMPT: &str = "\
You decide which catalog product a merchant offer is for. Pick the candidate
whose name describes the same product, or return null for product_id when none
does. Storage size and model generation must agree. Give a confidence between
0.0 and 1.0 and a short reason.";

const ATTRIBUTES_SYSTEM_PROMPT: &str = "\
You extract structured attributes from product text. Return key/value pairs
for facts stated in the text such as storage, color, model, generation,
screen_size and connectivity. Do not guess values that are not in the text.";

const ALERT_SYSTEM_PROMPT: &str = "\
Du skriver korte, vennlige e-postvarsler på norsk om prisfall. Emnelinjen skal
nevne produktet og den nye prisen. Brødteksten skal være 2-3 setninger.";

fn offer_instruction(payload: &NormalizeOfferPayload) -> Result<String, serde_json::Error> {
    let candidates: Vec<_> = payload
        .candidates
        .iter()
        .map(|c| json!({ "product_id": c.product_id, "name": c.name }))
        .collect();
    Ok(format!(
        "Offer title: {}\nMerchant: {}\nPrice: {} kr\n\nCandidates:\n{}",
        payload.merchant_title,
        payload.merchant_name,
        payload.price,
        serde_json::to_string_pretty(&candidates)?,
    ))
}

fn attributes_instruction(payload: &ExtractAttributesPayload) -> String {
    format!("Text:\n{}", payload.text)
}

fn alert_instruction(payload: &AlertEmailPayload) -> String {
    let mut text = format!(
        "Produkt: {}\nØnsket pris: {} kr\nNåværende pris: {} kr\nForhandler: {}",
        payload.product_name, payload.target_price, payload.current_price, payload.merchant_name
    );
    if let Some(url) = &payload.product_url {
        text.push_str(&format!("\nLenke: {url}"));
    }
    text
}

fn matched_candidate(answer: &OfferMatch, payload: &NormalizeOfferPayload) -> Option<Uuid> {
    let id = Uuid::parse_str(answer.product_id.as_deref()?.trim()).ok()?;
    payload.candidates.iter().any(|c| c.product_id == id).then_some(id)
}

fn validate_offer(answer: &OfferMatch, payload: &NormalizeOfferPayload) -> Result<(), JobError> {
    if !answer.confidence.is_finite() || !(0.0..=1.0).contains(&answer.confidence) {
        return Err(JobError::InvalidResult(format!(
            "confidence {} is outside 0..=1",
            answer.confidence
        )));
    }
    if answer.product_id.is_some() && matched_candidate(answer, payload).is_none() {
        return Err(JobError::InvalidResult(
            "product_id is not one of the candidates".into(),
        ));
    }
    Ok(())
}
