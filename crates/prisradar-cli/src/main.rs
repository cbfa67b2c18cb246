use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prisradar_pipeline::{open_store, tune_priorities, PipelineConfig, RunOptions, Services};
use prisradar_storage::{AdmissionAction, AdmissionRequest, BudgetAllocator, PgStore};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "prisradar")]
#[command(about = "Prisradar price tracker")]
struct Cli {
    /// Emit JSON logs and JSON command output.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape and match every due product once.
    Run {
        #[arg(long)]
        force: bool,
    },
    /// Process pending AI jobs.
    Drain {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Inspect or change today's scrape budget.
    Budget {
        #[command(subcommand)]
        action: BudgetCommand,
    },
    /// Adjust product priorities from recent match confidence.
    Tune,
    Migrate,
    /// Serve the HTTP API and the cron scheduler.
    Serve,
}

#[derive(Debug, Subcommand)]
enum BudgetCommand {
    Get,
    Allocate {
        #[arg(default_value_t = 1)]
        amount: i32,
    },
    Reset,
}

impl BudgetCommand {
    fn request(&self) -> AdmissionRequest {
        match self {
            BudgetCommand::Get => AdmissionRequest {
                action: AdmissionAction::Get,
                amount: None,
            },
            BudgetCommand::Allocate { amount } => AdmissionRequest {
                action: AdmissionAction::Allocate,
                amount: Some(*amount),
            },
            BudgetCommand::Reset => AdmissionRequest {
                action: AdmissionAction::Reset,
                amount: None,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = PipelineConfig::from_env();
    match cli.command.unwrap_or(Commands::Run { force: false }) {
        Commands::Run { force } => {
            let services = Services::from_config(config).await?;
            let summary = services.pipeline.run(RunOptions { force }).await?;
            if cli.json {
                print_json(&summary)?;
            } else {
                println!(
                    "run complete: run_id={} processed={} skipped={} budget_skipped={} failed={} variants_updated={} listings={}{}{}",
                    summary.run_id,
                    summary.products_processed,
                    summary.products_skipped,
                    summary.products_budget_skipped,
                    summary.products_failed,
                    summary.variants_updated,
                    summary.listings_scraped,
                    if summary.timed_out { " (timed out)" } else { "" },
                    if summary.budget_exhausted { " (budget exhausted)" } else { "" },
                );
            }
        }
        Commands::Drain { limit } => {
            let limit = limit.unwrap_or(config.drain_limit);
            let services = Services::from_config(config).await?;
            let report = services.queue.drain(limit).await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!("drain complete: processed={} claimed={}", report.processed, report.total);
                for job in report.results.iter().filter(|job| job.error.is_some()) {
                    println!(
                        "  failed {} {}: {}",
                        job.kind,
                        job.job_id,
                        job.error.as_deref().unwrap_or_default()
                    );
                }
            }
        }
        Commands::Budget { action } => {
            let store = open_store(&config).await?;
            let allocator = BudgetAllocator::new(store, config.daily_budget);
            let response = allocator.handle(action.request()).await?;
            if cli.json {
                print_json(&response)?;
            } else {
                println!(
                    "budget {}: used={} remaining={} total={} ok={}",
                    response.budget.date,
                    response.budget.used,
                    response.budget.remaining,
                    response.budget.total,
                    response.ok
                );
            }
        }
        Commands::Tune => {
            let store = open_store(&config).await?;
            let updates = tune_priorities(store.as_ref(), config.default_frequency_hours).await?;
            if cli.json {
                print_json(&updates)?;
            } else {
                println!("tuned {} products", updates.len());
                for update in &updates {
                    println!(
                        "  {}: confidence={:.2} priority {} -> {} frequency {}h -> {}h",
                        update.name,
                        update.mean_confidence,
                        update.priority_before,
                        update.priority_after,
                        update.frequency_hours_before,
                        update.frequency_hours_after
                    );
                }
            }
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to migrate")?;
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
            println!("migrations applied");
        }
        Commands::Serve => {
            let services = Services::from_config(config).await?;
            prisradar_web::serve(services).await?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "prisradar=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
