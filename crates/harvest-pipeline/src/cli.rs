//! `harvest` command-line interface
//!
//! Reads JSON lines of extracted records, runs them through the pipeline and
//! prints the run summary. Ctrl-C cancels the run; records already queued are
//! reported as cancelled.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::blob::{BlobStore, FsBlobStore, S3BlobStore};
use crate::config::{BlobBackend, EntityBackend, PipelineConfig};
use crate::error::SubmitError;
use crate::orchestrator::{Pipeline, PipelineHandle};
use crate::outcome::{PipelineOutcome, RunSummary};
use crate::record::RawRecord;
use crate::reporter::{DiscardingReporter, JsonLinesReporter, RunReporter};
use crate::store::{EntityStore, MemoryEntityStore, PgEntityStore};

/// Harvest - scraped item processing pipeline
#[derive(Parser, Debug)]
#[command(name = "harvest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process records from a JSON lines file
    Run {
        /// Pipeline configuration file
        #[arg(short, long, env = "HARVEST_CONFIG", default_value = "harvest.toml")]
        config: PathBuf,

        /// Input records, one JSON object per line ("-" reads stdin)
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Write one JSON outcome per record to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Hide the progress spinner
        #[arg(long)]
        no_progress: bool,
    },

    /// Validate a configuration file and print the resolved plan
    CheckConfig {
        /// Pipeline configuration file
        #[arg(short, long, env = "HARVEST_CONFIG", default_value = "harvest.toml")]
        config: PathBuf,
    },
}

/// Execute the CLI command
pub async fn execute(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Run {
            config,
            input,
            output,
            no_progress,
        } => run(config, input, output.as_deref(), !*no_progress).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = PipelineConfig::load(path)?;
    let plan = config.plan()?;

    println!("{}", "Configuration OK".green().bold());
    println!();
    println!("{}", plan);
    println!(
        "workers: {}, queue: {}, fetch concurrency: {}, cpu concurrency: {}",
        config.concurrency.workers,
        config.concurrency.queue_capacity,
        config.concurrency.fetch_concurrency,
        config.concurrency.cpu_concurrency
    );
    println!(
        "entity store: {:?}, blob store: {:?}",
        config.storage.backend, config.storage.blob
    );
    Ok(())
}

async fn run(config_path: &Path, input: &str, output: Option<&Path>, progress: bool) -> Result<()> {
    let config = PipelineConfig::load(config_path)?;
    let plan = config.plan()?;

    let blobs: Arc<dyn BlobStore> = match config.storage.blob {
        BlobBackend::Fs => Arc::new(FsBlobStore::new(&config.images.store, plan.store_format)),
        BlobBackend::S3 => Arc::new(S3BlobStore::new(&config.storage.s3, plan.store_format).await),
    };
    let store: Arc<dyn EntityStore> = match config.storage.backend {
        EntityBackend::Memory => Arc::new(MemoryEntityStore::new()),
        EntityBackend::Postgres => Arc::new(
            PgEntityStore::connect(&config.storage.database)
                .await
                .context("Failed to connect to the entity store")?,
        ),
    };
    info!(blob_backend = blobs.backend(), entity_backend = store.backend(), "Storage ready");

    let inner = outcome_reporter(output).await?;

    let bar = if progress {
        create_spinner("Processing records")
    } else {
        ProgressBar::hidden()
    };
    let reporter = Arc::new(ProgressReporter {
        inner,
        bar: bar.clone(),
    });

    let pipeline = Pipeline::new(&config, blobs, store, reporter)?;
    let handle = pipeline.start();

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let rejected = if input == "-" {
        feed(&handle, BufReader::new(tokio::io::stdin())).await?
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("Failed to open {}", input))?;
        feed(&handle, BufReader::new(file)).await?
    };

    let summary = handle.finish().await?;
    bar.finish_and_clear();

    print_summary(&summary, rejected);
    Ok(())
}

/// JSON-lines file reporter, or one that drops outcomes when there is no file
async fn outcome_reporter(output: Option<&Path>) -> Result<Arc<dyn RunReporter>> {
    let Some(path) = output else {
        return Ok(Arc::new(DiscardingReporter::new()));
    };
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(Arc::new(JsonLinesReporter::new(file)))
}

/// Submit every line of `reader`; returns the number of lines rejected at admission
async fn feed<R>(handle: &PipelineHandle, reader: R) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0usize;
    let mut rejected = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let raw: RawRecord = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping line that is not a JSON object");
                rejected += 1;
                continue;
            },
        };

        match handle.submit(raw).await {
            Ok(_) => {},
            Err(SubmitError::Rejected(e)) => {
                warn!(line = line_number, error = %e, "Record rejected");
                rejected += 1;
            },
            Err(SubmitError::Cancelled) | Err(SubmitError::Closed) => {
                info!(line = line_number, "Run stopped, no more records are read");
                break;
            },
        }
    }

    Ok(rejected)
}

fn print_summary(summary: &RunSummary, rejected: usize) {
    println!();
    println!("{}", "Run Summary:".cyan().bold());
    print!("{}", summary);
    if rejected > 0 {
        println!("{} input line(s) rejected before processing", rejected);
    }
    if summary.errored > 0 {
        println!("{}", format!("{} record(s) errored", summary.errored).red());
    }
}

/// Advances a spinner for each outcome before handing it on
struct ProgressReporter {
    inner: Arc<dyn RunReporter>,
    bar: ProgressBar,
}

#[async_trait]
impl RunReporter for ProgressReporter {
    async fn report(&self, outcome: &PipelineOutcome) -> std::io::Result<()> {
        self.bar.inc(1);
        if outcome.is_errored() {
            self.bar.set_message(format!("Processing records (last error: {})", outcome.identity_key));
        }
        self.inner.report(outcome).await
    }

    async fn finish(&self, summary: &RunSummary) -> std::io::Result<()> {
        self.inner.finish(summary).await
    }
}

/// Create a spinner counting processed records
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {pos} record(s) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
