//! Scrape-and-match pipeline, AI job queue and their wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prisradar_extract::{FirecrawlClient, ListingExtractor, ScrapeService};
use prisradar_oracle::{OpenAiCompatibleClient, Oracle, OracleError, ScriptedOracle};
use prisradar_storage::{
    BudgetAllocator, CatalogSeed, HttpClientConfig, HttpFetcher, MemoryStore, PageFetcher, PgStore, Store,
};
use tracing::{info, warn};

pub mod config;
pub mod matcher;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod tuning;

pub use config::PipelineConfig;
pub use matcher::{MatchError, MatchOutcome, MatchedGroup, MatchedListing, Matcher};
pub use orchestrator::{Pipeline, ProductOutcome, ProductStatus, RunOptions, RunSummary};
pub use queue::{DrainReport, JobError, JobQueue, JobReport};
pub use scheduler::maybe_build_scheduler;
pub use tuning::{retune, tune_priorities, PriorityUpdate};

pub const CRATE_NAME: &str = "prisradar-pipeline";

/// Everything a run, a drain or the web surface needs, built once per process.
#[derive(Clone)]
pub struct Services {
    pub config: PipelineConfig,
    pub store: Arc<dyn Store>,
    pub allocator: Arc<BudgetAllocator>,
    pub pipeline: Arc<Pipeline>,
    pub queue: Arc<JobQueue>,
}

impl Services {
    pub fn assemble(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        oracle: Arc<dyn Oracle>,
        scrape_service: Option<Arc<dyn ScrapeService>>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let allocator = Arc::new(BudgetAllocator::new(store.clone(), config.daily_budget));
        let extractor = Arc::new(ListingExtractor::new(allocator.clone(), scrape_service, fetcher));
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            extractor,
            Matcher::new(oracle.clone()),
            config.clone(),
        ));
        let queue = Arc::new(JobQueue::new(store.clone(), oracle));
        Self {
            config,
            store,
            allocator,
            pipeline,
            queue,
        }
    }

    /// Builds real collaborators from `config` and the provider environment
    /// variables. Missing provider keys degrade rather than fail.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = open_store(&config).await?;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        let scrape_service = FirecrawlClient::from_env()
            .context("configuring scrape service")?
            .map(|client| Arc::new(client) as Arc<dyn ScrapeService>);
        if scrape_service.is_none() {
            info!("SCRAPE_API_KEY not set, extraction uses direct fetch only");
        }
        Ok(Self::assemble(
            config,
            store,
            open_oracle()?,
            scrape_service,
            Arc::new(fetcher),
        ))
    }
}

pub async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn Store>> {
    if let Some(url) = &config.database_url {
        let store = PgStore::connect(url).await.context("connecting to database")?;
        return Ok(Arc::new(store));
    }
    if let Some(path) = &config.catalog_path {
        let seed = CatalogSeed::from_path(path)
            .await
            .with_context(|| format!("reading catalog {}", path.display()))?;
        info!(
            products = seed.products.len(),
            merchant_urls = seed.merchant_urls.len(),
            "using in-memory store seeded from catalog"
        );
        return Ok(Arc::new(MemoryStore::from_seed(seed)));
    }
    warn!("neither DATABASE_URL nor PRISRADAR_CATALOG is set, using an empty in-memory store");
    Ok(Arc::new(MemoryStore::new()))
}

fn open_oracle() -> Result<Arc<dyn Oracle>> {
    match OpenAiCompatibleClient::from_env() {
        Ok(client) => Ok(Arc::new(client)),
        Err(OracleError::NotConfigured(reason)) => {
            warn!(%reason, "oracle not configured, matching and jobs will fail until it is");
            Ok(Arc::new(ScriptedOracle::new()))
        }
        Err(err) => Err(err).context("configuring oracle"),
    }
}

pub async fn run_once_from_env(options: RunOptions) -> Result<RunSummary> {
    let services = Services::from_config(PipelineConfig::from_env()).await?;
    services.pipeline.run(options).await
}
