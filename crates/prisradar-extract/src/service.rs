//! Remote scrape service interface and a Firecrawl v1 client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const DEFAULT_API_URL: &str = "https://api.firecrawl.dev/v1";

#[derive(Debug, Error)]
pub enum ScrapeServiceError {
    /// Paid quota is used up; retrying later today will not help.
    #[error("scrape service quota exhausted")]
    QuotaExhausted,
    #[error("scrape service rate limited")]
    RateLimited,
    #[error("scrape service api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("scrape service network error: {0}")]
    Network(String),
    #[error("scrape service returned an unreadable body: {0}")]
    Decode(String),
}

impl ScrapeServiceError {
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status {
            StatusCode::PAYMENT_REQUIRED => ScrapeServiceError::QuotaExhausted,
            StatusCode::TOO_MANY_REQUESTS => ScrapeServiceError::RateLimited,
            other => ScrapeServiceError::Api {
                status: other.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ScrapeServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ScrapeServiceError::Decode(err.to_string())
        } else {
            ScrapeServiceError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeFormat {
    Markdown,
    Html,
    Links,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOptions {
    pub formats: Vec<ScrapeFormat>,
    pub timeout: Duration,
    pub wait_millis: Option<u64>,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            formats: vec![ScrapeFormat::Markdown, ScrapeFormat::Html, ScrapeFormat::Links],
            timeout: Duration::from_secs(30),
            wait_millis: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScrapedPage {
    #[serde(default)]
    pub markdown: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub metadata: PageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageMetadata {
    #[serde(default, rename = "sourceURL")]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BatchStatus {
    pub status: String,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub total: usize,
    #[serde(default, rename = "data")]
    pub results: Vec<ScrapedPage>,
}

impl BatchStatus {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    pub fn is_failed(&self) -> bool {
        self.status == "failed" || self.status == "cancelled"
    }
}

#[async_trait]
pub trait ScrapeService: Send + Sync {
    async fn scrape(&self, url: &str, options: &ScrapeOptions) -> Result<ScrapedPage, ScrapeServiceError>;

    /// Submits a batch and returns the service's job id.
    async fn batch_scrape(&self, urls: &[String], options: &ScrapeOptions) -> Result<String, ScrapeServiceError>;

    async fn poll_batch(&self, job_id: &str) -> Result<BatchStatus, ScrapeServiceError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeBody<'a> {
    url: &'a str,
    formats: &'a [ScrapeFormat],
    only_main_content: bool,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_for: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchBody<'a> {
    urls: &'a [String],
    formats: &'a [ScrapeFormat],
    only_main_content: bool,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_for: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ScrapeEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<ScrapedPage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FirecrawlClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl FirecrawlClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ScrapeServiceError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_API_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// `None` when `SCRAPE_API_KEY` is unset; extraction then always uses direct fetch.
    pub fn from_env() -> Result<Option<Self>, ScrapeServiceError> {
        let Some(key) = std::env::var("SCRAPE_API_KEY").ok().filter(|k| !k.trim().is_empty()) else {
            return Ok(None);
        };
        let client = Self::new(key)?;
        Ok(Some(match std::env::var("SCRAPE_API_URL") {
            Ok(url) if !url.trim().is_empty() => client.with_base_url(url),
            _ => client,
        }))
    }

    fn headers(&self) -> Result<HeaderMap, ScrapeServiceError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|e| {
            ScrapeServiceError::Api {
                status: 0,
                message: e.to_string(),
            }
        })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ScrapeServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ScrapeServiceError::from_status(status, message))
    }
}

#[async_trait]
impl ScrapeService for FirecrawlClient {
    async fn scrape(&self, url: &str, options: &ScrapeOptions) -> Result<ScrapedPage, ScrapeServiceError> {
        debug!(url, "remote scrape");
        let body = ScrapeBody {
            url,
            formats: &options.formats,
            only_main_content: true,
            timeout: options.timeout.as_millis() as u64,
            wait_for: options.wait_millis,
        };
        let response = self
            .http
            .post(format!("{}/scrape", self.base_url))
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        let envelope: ScrapeEnvelope = Self::check(response).await?.json().await?;
        match envelope.data {
            Some(page) if envelope.success => Ok(page),
            _ => Err(ScrapeServiceError::Decode(
                envelope.error.unwrap_or_else(|| "scrape response has no data".into()),
            )),
        }
    }

    async fn batch_scrape(&self, urls: &[String], options: &ScrapeOptions) -> Result<String, ScrapeServiceError> {
        debug!(count = urls.len(), "remote batch scrape");
        let body = BatchBody {
            urls,
            formats: &options.formats,
            only_main_content: true,
            timeout: options.timeout.as_millis() as u64,
            wait_for: options.wait_millis,
        };
        let response = self
            .http
            .post(format!("{}/batch/scrape", self.base_url))
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        let envelope: BatchEnvelope = Self::check(response).await?.json().await?;
        match envelope.id {
            Some(id) if envelope.success => Ok(id),
            _ => Err(ScrapeServiceError::Decode(
                envelope.error.unwrap_or_else(|| "batch response has no id".into()),
            )),
        }
    }

    async fn poll_batch(&self, job_id: &str) -> Result<BatchStatus, ScrapeServiceError> {
        let response = self
            .http
            .get(format!("{}/batch/scrape/{job_id}", self.base_url))
            .headers(self.headers()?)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
