use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::Source;
use harvest_engine::{
    build_cleanup_scheduler, run_duplicate_cleanup, CleanupOutcome, CommandLock, FixtureBatchProvider,
    HarvestConfig, NewRun, NoExternalReferences, RunCoordinator, RunError, RunService,
};
use harvest_store::{postgres::PgStore, Session, Store};
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Job posting harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extraction: keywords across sources, resolved against the
    /// shared database.
    Extract {
        /// Keywords to search for.
        #[arg(long, short, required = true, num_args = 1..)]
        keyword: Vec<String>,
        /// Sources to query; defaults to all of them.
        #[arg(long, short, value_delimiter = ',')]
        source: Vec<String>,
        /// Restrict to specific source configurations.
        #[arg(long, value_delimiter = ',')]
        configuration: Vec<String>,
        #[arg(long)]
        country: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        distance_km: Option<u32>,
        #[arg(long, default_value_t = 0)]
        page_offset: u32,
        #[arg(long, default_value_t = 1)]
        page_count: u32,
        /// Stop after this many findings.
        #[arg(long)]
        result_cap: Option<u32>,
    },
    /// Merge duplicate rows accumulated by past extractions.
    Dedup {
        /// Look-back window in days; defaults to the configured window.
        #[arg(long)]
        window_days: Option<u32>,
        /// Restrict posting reconciliation to these runs.
        #[arg(long, value_delimiter = ',')]
        run_id: Vec<Uuid>,
    },
    /// Print the completion estimate of a finished run.
    Progress { run_id: Uuid },
    /// Run the cleanup scheduler in the foreground until interrupted.
    Schedule,
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env();
    match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = ?err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: HarvestConfig) -> Result<ExitCode> {
    match cli.command {
        Commands::Extract {
            keyword,
            source,
            configuration,
            country,
            location,
            distance_km,
            page_offset,
            page_count,
            result_cap,
        } => {
            let Some(_lock) = CommandLock::acquire(&config.lock_dir, "extract")? else {
                eprintln!("another extraction is already running on this host");
                return Ok(ExitCode::FAILURE);
            };
            let sources = parse_sources(&source)?;
            let store = open_store(&config).await?;
            let session = Session::new(store);
            let runs = RunService::new(&session);
            let run = runs
                .create(NewRun {
                    keywords: keyword,
                    sources,
                    requested_configurations: configuration,
                    country,
                    location,
                    distance_km,
                    page_offset,
                    page_count,
                    result_cap,
                })
                .await?;

            let provider = FixtureBatchProvider::new(&config.fixtures_dir);
            let coordinator = RunCoordinator::new(&session, &provider);
            match coordinator.execute(run.id).await {
                Ok(finished) => {
                    println!(
                        "run {} {}: found={} new={} bound={} progress={}%",
                        finished.id,
                        finished.status.as_str(),
                        finished.found_count,
                        finished.new_count,
                        finished.bound_count,
                        finished.percentage_done.unwrap_or(0)
                    );
                    Ok(ExitCode::SUCCESS)
                }
                // Terminated runs were already stamped through a fresh
                // session; everything else gets its snapshot here so the
                // run never lingers IN_PROGRESS.
                Err(err @ RunError::Terminated(_)) => {
                    eprintln!("run {} failed: {err}", run.id);
                    Ok(ExitCode::FAILURE)
                }
                Err(err) => {
                    runs.mark_failed(run.id, &err.to_string()).await?;
                    eprintln!("run {} failed: {err}", run.id);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Dedup {
            window_days,
            run_id,
        } => {
            let Some(_lock) = CommandLock::acquire(&config.lock_dir, "dedup")? else {
                eprintln!("another cleanup is already running on this host");
                return Ok(ExitCode::FAILURE);
            };
            let store = open_store(&config).await?;
            let window = window_days.unwrap_or(config.cleanup_window_days);
            match run_duplicate_cleanup(store, &NoExternalReferences, window, &run_id).await? {
                CleanupOutcome::Skipped(reason) => {
                    println!("cleanup skipped: {reason}");
                    Ok(ExitCode::SUCCESS)
                }
                CleanupOutcome::Completed(report) => {
                    let merged: u64 = report.merged.values().sum();
                    println!(
                        "cleanup complete: merged={merged} removed={} failed={}",
                        report.removed,
                        report.failed.len()
                    );
                    for (kind, message) in &report.failed {
                        eprintln!("  {kind} cleaner failed: {message}");
                    }
                    if let Some(message) = &report.removal_error {
                        eprintln!("  removal pass failed: {message}");
                    }
                    if report.is_clean() {
                        Ok(ExitCode::SUCCESS)
                    } else {
                        Ok(ExitCode::FAILURE)
                    }
                }
            }
        }
        Commands::Progress { run_id } => {
            let store = open_store(&config).await?;
            let session = Session::new(store);
            let run = session
                .get_run(run_id)
                .await?
                .with_context(|| format!("run {run_id} not found"))?;
            let configs = session.keyword_configs(run_id).await?;
            let pct = RunService::new(&session).decide_progress(&run, &configs).await?;
            println!("run {} {}: {pct}%", run.id, run.status.as_str());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                println!("scheduler disabled; set HARVEST_SCHEDULER_ENABLED=1 to run it");
                return Ok(ExitCode::SUCCESS);
            }
            let store = open_store(&config).await?;
            let mut scheduler = build_cleanup_scheduler(
                store,
                &config.cleanup_cron,
                config.cleanup_window_days,
            )
            .await
            .context("building cleanup scheduler")?;
            scheduler.start().await.context("starting scheduler")?;
            println!("cleanup scheduler running ({}), ctrl-c to stop", config.cleanup_cron);
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await.context("stopping scheduler")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn open_store(config: &HarvestConfig) -> Result<Arc<dyn Store>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn parse_sources(raw: &[String]) -> Result<Vec<Source>> {
    if raw.is_empty() {
        return Ok(Source::ALL.to_vec());
    }
    raw.iter()
        .map(|s| Source::from_str(s).map_err(|_| anyhow::anyhow!("unknown source: {s}")))
        .collect()
}
