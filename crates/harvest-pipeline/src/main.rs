//! Harvest CLI - Main entry point

use clap::Parser;
use harvest_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use harvest_pipeline::cli::{execute, Cli};
use std::process;
use tracing::error;

/// Command-line logging defaults with `LOG_*` overrides read through `lookup`
///
/// Invalid overrides are reported and the command-line defaults kept.
fn log_config<F>(verbose: bool, lookup: F) -> LogConfig
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = LogConfig::builder()
        .level(if verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("harvest")
        .build();

    defaults.clone().merge_with(lookup).unwrap_or_else(|e| {
        eprintln!("Warning: ignoring invalid LOG_* settings: {}", e);
        defaults
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = log_config(cli.verbose, |key| std::env::var(key).ok());
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    if let Err(e) = execute(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
