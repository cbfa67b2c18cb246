//! Listing Extractor: budget-admitted page retrieval with remote-service and
//! direct-fetch paths, reduced to `ScrapedListing`s by the pure parser.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use prisradar_core::{ScrapedListing, SourceKind};
use prisradar_storage::{BudgetAllocator, BudgetError, PageFetcher};
use tracing::{debug, info, warn};

pub mod html;
pub mod parse;
pub mod service;

pub use html::{reduce_html, PageText};
pub use parse::{attach_listing_links, find_price, is_listing_link, parse_listings, ListingSource};
pub use service::{
    BatchStatus, FirecrawlClient, PageMetadata, ScrapeFormat, ScrapeOptions, ScrapeService,
    ScrapeServiceError, ScrapedPage,
};

pub const CRATE_NAME: &str = "prisradar-extract";

/// Settle delay for the client-rendered marketplace search page.
pub const MARKETPLACE_WAIT_MILLIS: u64 = 2000;

/// A page to extract from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTarget {
    pub url: String,
    pub merchant_name: String,
    pub kind: SourceKind,
}

impl SourceTarget {
    pub fn marketplace(url: impl Into<String>, merchant_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            merchant_name: merchant_name.into(),
            kind: SourceKind::Marketplace,
        }
    }

    pub fn retailer(url: impl Into<String>, merchant_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            merchant_name: merchant_name.into(),
            kind: SourceKind::Retailer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    pub wait_millis: Option<u64>,
    pub formats: Vec<ScrapeFormat>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            wait_millis: None,
            formats: vec![ScrapeFormat::Markdown, ScrapeFormat::Html, ScrapeFormat::Links],
        }
    }
}

impl ExtractOptions {
    pub fn marketplace() -> Self {
        Self {
            wait_millis: Some(MARKETPLACE_WAIT_MILLIS),
            ..Self::default()
        }
    }
}

/// Fire-and-poll limits for batched extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub fallback_concurrency: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_wait: Duration::from_secs(90),
            fallback_concurrency: 3,
        }
    }
}

pub struct ListingExtractor {
    allocator: Arc<BudgetAllocator>,
    service: Option<Arc<dyn ScrapeService>>,
    fetcher: Arc<dyn PageFetcher>,
    service_timeout: Duration,
    remote_disabled: AtomicBool,
}

impl ListingExtractor {
    pub fn new(
        allocator: Arc<BudgetAllocator>,
        service: Option<Arc<dyn ScrapeService>>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            allocator,
            service,
            fetcher,
            service_timeout: Duration::from_secs(30),
            remote_disabled: AtomicBool::new(false),
        }
    }

    /// Whether a quota-exhausted signal has switched this extractor to direct fetch.
    pub fn remote_disabled(&self) -> bool {
        self.remote_disabled.load(Ordering::Relaxed)
    }

    fn remote(&self) -> Option<&Arc<dyn ScrapeService>> {
        if self.remote_disabled() {
            return None;
        }
        self.service.as_ref()
    }

    fn scrape_options(&self, options: &ExtractOptions) -> ScrapeOptions {
        ScrapeOptions {
            formats: options.formats.clone(),
            timeout: self.service_timeout,
            wait_millis: options.wait_millis,
        }
    }

    fn note_service_error(&self, url: &str, err: &ScrapeServiceError) {
        match err {
            ScrapeServiceError::QuotaExhausted => {
                if !self.remote_disabled.swap(true, Ordering::Relaxed) {
                    warn!(url, "scrape service quota exhausted, using direct fetch for the rest of the run");
                }
            }
            other => warn!(url, error = %other, "scrape service failed, falling back to direct fetch"),
        }
    }

    /// Whether today's scrape budget is spent. Stays set until the budget is
    /// reset or the date changes.
    pub fn budget_exhausted(&self) -> bool {
        self.allocator.exhausted_today()
    }

    /// Takes one unit of budget. `false` means the caller should skip the page.
    async fn admit(&self, url: &str) -> bool {
        if self.budget_exhausted() {
            debug!(url, "scrape budget already exhausted, skipping page");
            return false;
        }
        match self.allocator.allocate(1).await {
            Ok(_) => true,
            Err(BudgetError::Insufficient { remaining, .. }) => {
                debug!(url, remaining, "scrape budget exhausted, skipping page");
                false
            }
            Err(err) => {
                warn!(url, error = %err, "scrape budget unavailable, skipping page");
                false
            }
        }
    }

    /// Extracts listings from one page. Budget denial and total retrieval
    /// failure both yield an empty list.
    pub async fn extract(&self, target: &SourceTarget, options: &ExtractOptions) -> Vec<ScrapedListing> {
        if !self.admit(&target.url).await {
            return Vec::new();
        }
        self.extract_admitted(target, options).await
    }

    async fn extract_admitted(&self, target: &SourceTarget, options: &ExtractOptions) -> Vec<ScrapedListing> {
        if let Some(service) = self.remote() {
            match service.scrape(&target.url, &self.scrape_options(options)).await {
                Ok(page) => {
                    if let Some(content) = page_text(&page, &target.url) {
                        return listings_from(target, &content);
                    }
                    debug!(url = %target.url, "scrape service returned no content, falling back");
                }
                Err(err) => self.note_service_error(&target.url, &err),
            }
        }
        match self.fetch_direct(&target.url).await {
            Some(content) => listings_from(target, &content),
            None => Vec::new(),
        }
    }

    async fn fetch_direct(&self, url: &str) -> Option<PageText> {
        match self.fetcher.fetch_page(url).await {
            Ok(page) => Some(reduce_html(&page.body, &page.final_url)),
            Err(err) => {
                warn!(url, error = %err, "direct fetch failed");
                None
            }
        }
    }

    /// Extracts many pages with one remote batch job. Each URL is admitted
    /// individually; results still pending at `policy.max_wait` are dropped.
    pub async fn extract_batch(
        &self,
        targets: &[SourceTarget],
        options: &ExtractOptions,
        policy: BatchPolicy,
    ) -> Vec<ScrapedListing> {
        let mut admitted = Vec::with_capacity(targets.len());
        for target in targets {
            if self.budget_exhausted() {
                break;
            }
            if self.admit(&target.url).await {
                admitted.push(target.clone());
            }
        }
        if admitted.is_empty() {
            return Vec::new();
        }

        if let Some(service) = self.remote() {
            let urls: Vec<String> = admitted.iter().map(|t| t.url.clone()).collect();
            match service.batch_scrape(&urls, &self.scrape_options(options)).await {
                Ok(job_id) => {
                    let status = self.await_batch(service.as_ref(), &job_id, policy).await;
                    return batch_listings(&admitted, &status);
                }
                Err(err) => self.note_service_error("batch", &err),
            }
        }

        // Already charged above, so the fallback must not admit again.
        let pending: Vec<_> = admitted
            .iter()
            .map(|target| self.extract_admitted(target, options))
            .collect();
        stream::iter(pending)
            .buffer_unordered(policy.fallback_concurrency.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn await_batch(&self, service: &dyn ScrapeService, job_id: &str, policy: BatchPolicy) -> BatchStatus {
        let started = tokio::time::Instant::now();
        let mut latest = BatchStatus::default();
        loop {
            match service.poll_batch(job_id).await {
                Ok(status) => {
                    debug!(job_id, completed = status.completed, total = status.total, "batch progress");
                    let done = status.is_completed() || status.is_failed();
                    latest = status;
                    if done {
                        break;
                    }
                }
                Err(err) => {
                    warn!(job_id, error = %err, "batch poll failed, using partial results");
                    break;
                }
            }
            if started.elapsed() + policy.poll_interval > policy.max_wait {
                info!(job_id, completed = latest.completed, total = latest.total, "batch timed out, using partial results");
                break;
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
        latest
    }
}

fn page_text(page: &ScrapedPage, url: &str) -> Option<PageText> {
    if let Some(markdown) = page.markdown.as_deref().filter(|m| !m.trim().is_empty()) {
        let links = if page.links.is_empty() {
            page.html
                .as_deref()
                .map(|html| reduce_html(html, url).links)
                .unwrap_or_default()
        } else {
            page.links.clone()
        };
        return Some(PageText {
            text: markdown.to_string(),
            links,
        });
    }
    let html = page.html.as_deref().filter(|h| !h.trim().is_empty())?;
    let mut reduced = reduce_html(html, url);
    if !page.links.is_empty() {
        reduced.links = page.links.clone();
    }
    Some(reduced)
}

fn listings_from(target: &SourceTarget, content: &PageText) -> Vec<ScrapedListing> {
    let source = ListingSource {
        merchant_name: &target.merchant_name,
        condition: target.kind.condition(),
        page_url: &target.url,
    };
    let mut listings = parse_listings(&content.text, &source);
    if target.kind == SourceKind::Marketplace {
        attach_listing_links(&mut listings, &content.links);
    }
    debug!(url = %target.url, count = listings.len(), "parsed listings");
    listings
}

fn normalize_url(url: &str) -> &str {
    url.trim_end_matches('/')
}

fn batch_listings(admitted: &[SourceTarget], status: &BatchStatus) -> Vec<ScrapedListing> {
    let by_url: HashMap<&str, &SourceTarget> =
        admitted.iter().map(|t| (normalize_url(&t.url), t)).collect();
    let mut listings = Vec::new();
    for (index, page) in status.results.iter().enumerate() {
        let target = match page.metadata.source_url.as_deref() {
            Some(source) => by_url.get(normalize_url(source)).copied(),
            None => admitted.get(index),
        };
        let Some(target) = target else {
            debug!(source = ?page.metadata.source_url, "batch result for unknown url");
            continue;
        };
        if let Some(content) = page_text(page, &target.url) {
            listings.extend(listings_from(target, &content));
        }
    }
    listings
}
