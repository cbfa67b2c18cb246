use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::orchestrator::{Pipeline, RunOptions};
use crate::queue::JobQueue;

/// Cron jobs for the catalog pass and the job-queue drain. `None` unless
/// `PRISRADAR_SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(
    config: &PipelineConfig,
    pipeline: Arc<Pipeline>,
    queue: Arc<JobQueue>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let run_cron = with_seconds(&config.run_cron);
    let run_job = Job::new_async(run_cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run(RunOptions::default()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    processed = summary.products_processed,
                    "scheduled pipeline run finished"
                ),
                Err(err) => warn!(error = %err, "scheduled pipeline run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {run_cron}"))?;
    sched.add(run_job).await.context("adding pipeline job")?;

    let drain_cron = with_seconds(&config.drain_cron);
    let drain_limit = config.drain_limit;
    let drain_job = Job::new_async(drain_cron.as_str(), move |_uuid, _l| {
        let queue = queue.clone();
        Box::pin(async move {
            if let Err(err) = queue.drain(drain_limit).await {
                warn!(error = %err, "scheduled job drain failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {drain_cron}"))?;
    sched.add(drain_job).await.context("adding drain job")?;

    Ok(Some(sched))
}

/// Five-field crontab lines get a leading seconds field; the scheduler's
/// parser expects six or seven fields.
fn with_seconds(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Services;
    use async_trait::async_trait;
    use prisradar_oracle::ScriptedOracle;
    use prisradar_storage::{FetchError, FetchedPage, MemoryStore, PageFetcher};

    struct Offline;

    #[async_trait]
    impl PageFetcher for Offline {
        async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            })
        }
    }

    fn services(config: PipelineConfig) -> Services {
        Services::assemble(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedOracle::new()),
            None,
            Arc::new(Offline),
        )
    }

    #[test]
    fn crontab_lines_gain_a_seconds_field() {
        assert_eq!(with_seconds("0 3 * * *"), "0 0 3 * * *");
        assert_eq!(with_seconds(" */10 * * * * "), "0 */10 * * * *");
        assert_eq!(with_seconds("30 0 3 * * *"), "30 0 3 * * *");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn default_crons_build_a_scheduler() {
        let config = PipelineConfig {
            scheduler_enabled: true,
            ..PipelineConfig::default()
        };
        let services = services(config.clone());

        let sched = maybe_build_scheduler(&config, services.pipeline.clone(), services.queue.clone())
            .await
            .unwrap();

        assert!(sched.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_cron_is_reported() {
        let config = PipelineConfig {
            scheduler_enabled: true,
            run_cron: "every night".into(),
            ..PipelineConfig::default()
        };
        let services = services(config.clone());

        let err = maybe_build_scheduler(&config, services.pipeline.clone(), services.queue.clone())
            .await
            .err()
            .unwrap();

        assert!(err.to_string().contains("every night"));
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = PipelineConfig::default();
        let services = services(config.clone());
        let sched = maybe_build_scheduler(&config, services.pipeline.clone(), services.queue.clone())
            .await
            .unwrap();
        assert!(sched.is_none());
    }
}
