use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use prisradar_core::PriceBounds;
use prisradar_storage::{BROWSER_USER_AGENT, DEFAULT_DAILY_BUDGET};

pub const DEFAULT_MARKETPLACE_SEARCH_URL: &str =
    "https://www.finn.no/bap/forsale/search.html?q={query}";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub catalog_path: Option<PathBuf>,
    pub daily_budget: i32,
    pub product_concurrency: usize,
    pub source_concurrency: usize,
    pub step_timeout: Duration,
    pub run_timeout: Duration,
    pub batch_retailers: bool,
    pub batch_poll_interval: Duration,
    pub batch_max_wait: Duration,
    pub default_frequency_hours: f64,
    pub marketplace_name: String,
    pub marketplace_search_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub run_cron: String,
    pub drain_cron: String,
    pub drain_limit: usize,
    pub web_port: u16,
    pub price_bounds: BTreeMap<String, PriceBounds>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            catalog_path: None,
            daily_budget: DEFAULT_DAILY_BUDGET,
            product_concurrency: 4,
            source_concurrency: 3,
            step_timeout: Duration::from_secs(120),
            run_timeout: Duration::from_secs(1800),
            batch_retailers: false,
            batch_poll_interval: Duration::from_secs(3),
            batch_max_wait: Duration::from_secs(90),
            default_frequency_hours: 24.0,
            marketplace_name: "Finn.no".to_string(),
            marketplace_search_url: DEFAULT_MARKETPLACE_SEARCH_URL.to_string(),
            user_agent: BROWSER_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            run_cron: "0 3 * * *".to_string(),
            drain_cron: "*/10 * * * *".to_string(),
            drain_limit: 10,
            web_port: 8000,
            price_bounds: BTreeMap::from([(
                "smartphone".to_string(),
                PriceBounds {
                    min: 3000.0,
                    max: 30000.0,
                },
            )]),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("DATABASE_URL"),
            catalog_path: env_string("PRISRADAR_CATALOG").map(PathBuf::from),
            daily_budget: env_parse("PRISRADAR_DAILY_BUDGET").unwrap_or(defaults.daily_budget),
            product_concurrency: env_parse("PRISRADAR_PRODUCT_CONCURRENCY")
                .unwrap_or(defaults.product_concurrency),
            source_concurrency: env_parse("PRISRADAR_SOURCE_CONCURRENCY")
                .unwrap_or(defaults.source_concurrency),
            step_timeout: env_secs("PRISRADAR_STEP_TIMEOUT_SECS").unwrap_or(defaults.step_timeout),
            run_timeout: env_secs("PRISRADAR_RUN_TIMEOUT_SECS").unwrap_or(defaults.run_timeout),
            batch_retailers: env_flag("PRISRADAR_BATCH_RETAILERS"),
            batch_poll_interval: env_secs("PRISRADAR_BATCH_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.batch_poll_interval),
            batch_max_wait: env_secs("PRISRADAR_BATCH_MAX_WAIT_SECS")
                .unwrap_or(defaults.batch_max_wait),
            default_frequency_hours: env_parse("PRISRADAR_DEFAULT_FREQUENCY_HOURS")
                .unwrap_or(defaults.default_frequency_hours),
            marketplace_name: env_string("PRISRADAR_MARKETPLACE_NAME")
                .unwrap_or(defaults.marketplace_name),
            marketplace_search_url: env_string("PRISRADAR_MARKETPLACE_SEARCH_URL")
                .unwrap_or(defaults.marketplace_search_url),
            user_agent: env_string("PRISRADAR_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("PRISRADAR_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: env_flag("PRISRADAR_SCHEDULER_ENABLED"),
            run_cron: env_string("PRISRADAR_RUN_CRON").unwrap_or(defaults.run_cron),
            drain_cron: env_string("PRISRADAR_DRAIN_CRON").unwrap_or(defaults.drain_cron),
            drain_limit: env_parse("PRISRADAR_DRAIN_LIMIT").unwrap_or(defaults.drain_limit),
            web_port: env_parse("PRISRADAR_WEB_PORT").unwrap_or(defaults.web_port),
            price_bounds: defaults.price_bounds,
        }
    }

    pub fn price_bounds_for(&self, category: &str) -> Option<PriceBounds> {
        self.price_bounds.get(category).copied()
    }

    /// Marketplace search page for a product name.
    pub fn marketplace_url(&self, product_name: &str) -> String {
        let query: String = url::form_urlencoded::byte_serialize(product_name.as_bytes()).collect();
        self.marketplace_search_url.replace("{query}", &query)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}
