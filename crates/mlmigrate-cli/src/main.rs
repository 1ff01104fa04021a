//! mlmigrate - export and import MLflow experiments and registered models.
//!
//! Every command can be rerun after an interruption or partial failure: completed work
//! is read back from the snapshot directory and skipped.

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use mlmigrate_core::{CancellationToken, Defaults};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "mlmigrate", version)]
#[command(about = "Resumable migration of MLflow experiments and registered models")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export one experiment and its runs
    ExportExperiment {
        /// Experiment ID or name
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        output_dir: PathBuf,
        /// Export only these run IDs instead of listing the experiment
        #[arg(long, value_delimiter = ',')]
        run_ids: Vec<String>,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Import one exported experiment
    ImportExperiment {
        #[arg(long)]
        input_dir: PathBuf,
        /// Destination experiment name (defaults to the source name)
        #[arg(long)]
        experiment_name: Option<String>,
        #[command(flatten)]
        destination: DestinationArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Export one registered model and its versions
    ExportModel {
        #[arg(long)]
        model: String,
        #[arg(long)]
        output_dir: PathBuf,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Import one exported registered model
    ImportModel {
        #[arg(long)]
        input_dir: PathBuf,
        /// Destination model name (defaults to the source name)
        #[arg(long)]
        model_name: Option<String>,
        /// Bulk experiment directory whose imports resolve the model's runs
        #[arg(long)]
        experiments_dir: PathBuf,
        #[command(flatten)]
        destination: DestinationArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Export all experiments and registered models
    ExportAll {
        #[arg(long)]
        output_dir: PathBuf,
        /// Skip registered models
        #[arg(long)]
        experiments_only: bool,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Import a directory written by export-all
    ImportAll {
        #[arg(long)]
        input_dir: PathBuf,
        /// Skip registered models
        #[arg(long)]
        experiments_only: bool,
        #[command(flatten)]
        destination: DestinationArgs,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Source tracking server URI ("memory" for an empty in-process store)
    #[arg(long)]
    source_uri: String,
    /// Bearer token for the source server
    #[arg(long)]
    source_token: Option<String>,
}

#[derive(Args, Debug)]
struct DestinationArgs {
    /// Destination tracking server URI ("memory" for a dry run)
    #[arg(long)]
    dest_uri: String,
    /// Bearer token for the destination server
    #[arg(long)]
    dest_token: Option<String>,
    /// Delete an existing destination parent before a fresh import
    #[arg(long)]
    delete_existing: bool,
    /// Tag imported entities with their source identity
    #[arg(long)]
    import_source_tags: bool,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Only these parent IDs or names
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,
    /// Skip these parent IDs or names
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
    /// Only parents whose name contains this text (e.g. "/Users/alice")
    #[arg(long)]
    name_contains: Option<String>,
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Total concurrent child migrations
    #[arg(long, default_value_t = Defaults::THREAD_BUDGET)]
    threads: usize,
    /// Parents migrated in parallel (bulk commands)
    #[arg(long, default_value_t = Defaults::PARENT_CONCURRENCY)]
    parent_threads: usize,
    /// Children submitted between checkpoints
    #[arg(long, default_value_t = Defaults::BATCH_SIZE)]
    batch_size: usize,
    /// Page size for source listings
    #[arg(long, default_value_t = Defaults::PAGE_SIZE)]
    page_size: usize,
    /// Attempts per store call on transient errors
    #[arg(long, default_value_t = Defaults::RETRY_ATTEMPTS)]
    retries: u32,
    /// Redo children that a previous export already completed
    #[arg(long)]
    force: bool,
}

fn init_logging(debug: bool, json: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.json_logs);

    info!("Starting mlmigrate {}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work");
            on_signal.cancel();
        }
    });

    commands::run(cli.command, cancel).await
}
