use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value as JsonValue;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vwh_core::SystemClock;
use vwh_storage::LandingStore;
use vwh_sync::{
    land_batch, report_runs_markdown, PgWarehouse, RunRequest, SyncConfig, SyncPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "vwh")]
#[command(about = "Video metrics warehouse command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Land a raw API dump (a JSON array of video records).
    Land {
        #[arg(long)]
        file: PathBuf,
    },
    /// Run staging, merge and snapshot for one logical date.
    Run {
        #[arg(long)]
        logical_date: NaiveDate,
        #[arg(long)]
        full_refresh: bool,
        /// Landed batch file; defaults to the latest batch for the source.
        #[arg(long)]
        batch: Option<PathBuf>,
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        prior_run_complete: bool,
    },
    /// Apply database migrations (requires DATABASE_URL).
    Migrate,
    /// Summarise recent run reports as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_logging(level: &str) {
    // RUST_LOG still wins over VWH_LOG_LEVEL.
    let default = format!("{level},vwh_sync={level},sqlx=warn");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let level = std::env::var("VWH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    init_logging(&level);

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command {
        Commands::Land { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let JsonValue::Array(records) = serde_json::from_str::<JsonValue>(&text)
                .with_context(|| format!("parsing {}", file.display()))?
            else {
                bail!("{} does not contain a JSON array", file.display());
            };
            let landing = LandingStore::new(config.landing_dir.clone());
            let landed = land_batch(&landing, &config.source_id, &records, &SystemClock).await?;
            println!(
                "landed: batch={} records={} bytes={} deduplicated={}",
                landed.handle, landed.record_count, landed.byte_size, landed.deduplicated
            );
        }
        Commands::Run {
            logical_date,
            full_refresh,
            batch,
            prior_run_complete,
        } => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let batch = match batch {
                Some(path) => pipeline.landing().open_handle(&path).await?,
                None => pipeline
                    .latest_batch()
                    .await?
                    .with_context(|| format!("no landed batch for source {}", config.source_id))?,
            };
            info!(batch = %batch, %logical_date, "starting run");
            let report = pipeline
                .run_once(&RunRequest {
                    batch,
                    logical_date,
                    full_refresh,
                    prior_run_complete,
                })
                .await?;
            println!(
                "run complete: run_id={} status={:?} inserted={} updated={} unchanged={} deleted={} skipped={} snapshot_rows={}",
                report.run_id,
                report.status,
                report.merge.inserted,
                report.merge.updated,
                report.merge.unchanged,
                report.merge.deleted,
                report.skipped_total(),
                report.snapshot_rows,
            );
            if let Some(dir) = &report.report_dir {
                println!("report: {dir}");
            }
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is not set; the in-memory warehouse needs no migrations")?;
            PgWarehouse::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Report { runs } => {
            println!("{}", report_runs_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
