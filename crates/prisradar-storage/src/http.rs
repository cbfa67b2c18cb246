//! Direct page fetching, used when the scrape service cannot serve a page.
//!
//! Shops are polite-limited per host on top of a global in-flight cap, and
//! throttled or overloaded responses are retried with doubling delays.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

/// Sent when fetching shop pages directly; several shops reject bot agents.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const NORWEGIAN_FIRST: &str = "nb-NO,nb;q=0.9,no;q=0.8,en;q=0.5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt + 1`. A server-sent `Retry-After`
    /// replaces the doubling schedule; both are capped at `max_delay`.
    pub fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let doubled = self
            .first_delay
            .saturating_mul(1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX));
        retry_after.unwrap_or(doubled).min(self.max_delay)
    }
}

/// Throttling, request timeouts and shop-side failures are worth another try.
pub fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_in_flight: usize,
    pub max_per_shop: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: BROWSER_USER_AGENT.to_string(),
            max_in_flight: 8,
            max_per_shop: 2,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Bot protection or a login wall; retrying will not help.
    #[error("blocked with status {status} by {url}")]
    Blocked { status: u16, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    fn from_status(status: StatusCode, url: &str) -> Self {
        let (status, url) = (status.as_u16(), url.to_string());
        match status {
            401 | 403 => FetchError::Blocked { status, url },
            _ => FetchError::HttpStatus { status, url },
        }
    }
}

/// Source of raw page bodies. `HttpFetcher` is the production implementation.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    max_per_shop: usize,
    shops: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(NORWEGIAN_FIRST));
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building page fetch client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            max_per_shop: config.max_per_shop.max(1),
            shops: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn shop_permits(&self, url: &str) -> Arc<Semaphore> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
            .unwrap_or_default();
        let mut shops = self.shops.lock().await;
        shops
            .entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_shop)))
            .clone()
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0;
        loop {
            let wait = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status().as_u16();
                    let final_url = resp.url().to_string();
                    let body = resp.text().await?;
                    debug!(status, bytes = body.len(), "page fetched");
                    return Ok(FetchedPage {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !is_transient(status) || attempt >= self.retry.retries {
                        return Err(FetchError::from_status(status, resp.url().as_str()));
                    }
                    self.retry.delay(attempt, retry_after(resp.headers()))
                }
                Err(err) => {
                    if !(err.is_timeout() || err.is_connect()) || attempt >= self.retry.retries {
                        return Err(err.into());
                    }
                    self.retry.delay(attempt, None)
                }
            };
            debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying page fetch");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _slot = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let shop = self.shop_permits(url).await;
        let _shop_slot = shop.acquire().await.map_err(|_| FetchError::Closed)?;

        self.get_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }
}
