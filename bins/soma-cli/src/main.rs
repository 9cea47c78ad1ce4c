//! # SOMA CLI - Somali Corpus Ingestion Runner
//!
//! One invocation runs the full pipeline for one source, producing a silver
//! partition, a manifest, a metrics document and a quality report.
//!
//! ## Usage
//!
//! ```bash
//! # Ingest one source (config file optional; environment overrides win)
//! soma ingest wikipedia-somali
//! soma --config soma.toml ingest bbc-somali --max-items 50
//! soma ingest tiktok --force --date 2026-08-01
//!
//! # Check an existing partition
//! soma validate-silver data/processed/silver/source=Wikipedia-Somali/date_accessed=2026-08-01
//! ```
//!
//! Exit codes: 0 success, 1 partial success with non-fatal errors,
//! 2 fatal error, 3 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use soma_core::{AppConfig, RunContext};
use soma_pipeline::{registry, validate::validate_partition, IngestPipeline};

#[derive(Parser, Debug)]
#[command(name = "soma")]
#[command(about = "Somali corpus ingestion pipeline")]
struct Args {
    /// Configuration file (TOML or YAML); environment variables with the
    /// SOMA prefix override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline for one source
    Ingest {
        /// Source name or slug (wikipedia-somali, bbc-somali,
        /// huggingface-somali, sprakbanken, tiktok)
        source: String,

        /// Re-open terminal ledger entries and re-fetch
        #[arg(long)]
        force: bool,

        /// Hard cap on units this run, overriding configuration
        #[arg(long)]
        max_items: Option<usize>,

        /// Partition date override (YYYY-MM-DD); defaults to today (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Check schema and manifest integrity of a silver partition
    ValidateSilver {
        /// Partition directory (source=<S>/date_accessed=<D>)
        partition: PathBuf,
    },
}

fn init_tracing(cfg: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.to_lowercase()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match AppConfig::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(3);
        }
    };
    init_tracing(&cfg);

    match args.command {
        Command::Ingest {
            source,
            force,
            max_items,
            date,
        } => ingest(cfg, &source, force, max_items, date).await,
        Command::ValidateSilver { partition } => validate(&partition),
    }
}

async fn ingest(
    cfg: AppConfig,
    source: &str,
    force: bool,
    max_items: Option<usize>,
    date: Option<NaiveDate>,
) -> ExitCode {
    let Some(slug) = registry::resolve_slug(source) else {
        error!(source, "unknown source");
        return ExitCode::from(3);
    };
    let run = RunContext::new(slug, date, force);
    let adapter = match registry::build_adapter(slug, &cfg, &run) {
        Ok(adapter) => adapter,
        Err(e) => {
            error!(error = %e, "adapter construction failed");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C, draining in-flight work");
            signal_cancel.cancel();
        }
    });

    let pipeline = IngestPipeline::new(cfg, adapter, run).with_max_items(max_items);
    match pipeline.run(cancel).await {
        Ok(outcome) => {
            info!(
                run_id = %outcome.run_id,
                records = outcome.records_written,
                partition = %outcome.partition_dir.display(),
                health = outcome.summary.health.as_str(),
                canceled = outcome.canceled,
                "ingestion finished"
            );
            if let Some(fatal) = &outcome.fatal {
                error!(%fatal, "run ended with a fatal error");
            }
            ExitCode::from(outcome.exit_code() as u8)
        }
        Err(e) => {
            error!(error = %e, "ingestion aborted");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn validate(partition: &std::path::Path) -> ExitCode {
    match validate_partition(partition) {
        Ok(report) if report.passed() => {
            info!(
                files = report.files_checked,
                records = report.records_checked,
                "partition is valid"
            );
            ExitCode::SUCCESS
        }
        Ok(report) => {
            for problem in &report.problems {
                error!(%problem, "validation problem");
            }
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "validation failed to run");
            ExitCode::from(2)
        }
    }
}
