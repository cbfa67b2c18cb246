//! AI job queue model: typed payloads per job kind, typed results, and the
//! result cache entry.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CACHE_TTL_HOURS: i64 = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Transitions only move forward: pending -> processing -> completed|failed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    NormalizeOffer,
    ExtractAttributes,
    WriteAlertEmail,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::NormalizeOffer => "normalize_offer",
            JobKind::ExtractAttributes => "extract_attributes",
            JobKind::WriteAlertEmail => "write_alert_email",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferCandidate {
    pub product_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeOfferPayload {
    #[serde(default)]
    pub merchant_offer_id: Option<Uuid>,
    pub merchant_title: String,
    pub merchant_name: String,
    pub price: f64,
    #[serde(default)]
    pub url: Option<String>,
    pub candidates: Vec<OfferCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractAttributesPayload {
    pub product_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEmailPayload {
    pub product_name: String,
    pub target_price: f64,
    pub current_price: f64,
    pub merchant_name: String,
    #[serde(default)]
    pub product_url: Option<String>,
}

/// Work description for a job, serialized as `{ "kind": ..., "payload": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobTask {
    NormalizeOffer(NormalizeOfferPayload),
    ExtractAttributes(ExtractAttributesPayload),
    WriteAlertEmail(AlertEmailPayload),
}

impl JobTask {
    pub fn kind(&self) -> JobKind {
        match self {
            JobTask::NormalizeOffer(_) => JobKind::NormalizeOffer,
            JobTask::ExtractAttributes(_) => JobKind::ExtractAttributes,
            JobTask::WriteAlertEmail(_) => JobKind::WriteAlertEmail,
        }
    }
}

/// Deterministic cache key for a task: SHA-256 over kind and canonical payload JSON.
pub fn cache_key_for(task: &JobTask) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(task)?;
    let mut hasher = Sha256::new();
    hasher.update(task.kind().as_str().as_bytes());
    hasher.update(b":");
    hasher.update(serde_json::to_vec(&canonical)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Outcome of matching a merchant offer against candidate products.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OfferMatch {
    /// The `product_id` of the matching candidate, or null when none matches.
    pub product_id: Option<String>,
    /// Match confidence between 0.0 and 1.0.
    pub confidence: f64,
    /// Brief explanation of the decision.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Attribute {
    /// Attribute name such as storage, color, model or generation.
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AttributeSet {
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AlertEmail {
    pub subject: String,
    pub body: String,
}

/// Computed job output, also the cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum JobResult {
    NormalizeOffer(OfferMatch),
    ExtractAttributes(AttributeSet),
    WriteAlertEmail(AlertEmail),
}

impl JobResult {
    pub fn kind(&self) -> JobKind {
        match self {
            JobResult::NormalizeOffer(_) => JobKind::NormalizeOffer,
            JobResult::ExtractAttributes(_) => JobKind::ExtractAttributes,
            JobResult::WriteAlertEmail(_) => JobKind::WriteAlertEmail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiJob {
    pub id: Uuid,
    #[serde(flatten)]
    pub task: JobTask,
    #[serde(default)]
    pub cache_key: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl AiJob {
    pub fn pending(task: JobTask, cache_key: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            cache_key,
            status: JobStatus::Pending,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.task.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub result: JobResult,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(cache_key: impl Into<String>, result: JobResult, now: DateTime<Utc>) -> Self {
        Self {
            cache_key: cache_key.into(),
            result,
            created_at: now,
            expires_at: now + Duration::hours(CACHE_TTL_HOURS),
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOffer {
    pub id: Uuid,
    pub merchant_offer_id: Option<Uuid>,
    pub normalized_product_id: Uuid,
    pub confidence: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductAttribute {
    pub product_id: Uuid,
    pub attribute_key: String,
    pub attribute_value: String,
    pub source: String,
}
