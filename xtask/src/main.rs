//! Build automation tasks for Harvest
//!
//! Currently generates the CLI reference from the clap definitions.

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for Harvest", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<harvest_pipeline::cli::Cli>();

    let content = format!(
        r#"# Harvest CLI Reference

Generated from the CLI source code on {}.

## Overview

`harvest` reads scraped records as JSON lines, fetches their assets,
derives thumbnails, validates them and writes one deduplicated entity per
identity.

## Quick Start

```bash
# Check a configuration and print the resolved plan
harvest check-config --config harvest.toml

# Process records, writing one outcome per line
harvest run --config harvest.toml --input items.jsonl --output outcomes.jsonl
```

## Commands

{}

## Environment Variables

- `HARVEST_CONFIG` - Configuration file (default: `harvest.toml`)
- `HARVEST_WORKERS`, `HARVEST_QUEUE_CAPACITY`, `HARVEST_FETCH_CONCURRENCY`, `HARVEST_CPU_CONCURRENCY` - Concurrency overrides
- `HARVEST_LOG_LIMIT` - Individually logged outcomes per run
- `HARVEST_IMAGES_STORE` - Blob directory for the `fs` backend
- `DATABASE_URL` - PostgreSQL connection string for the `postgres` backend
- `S3_ENDPOINT`, `S3_REGION`, `S3_BUCKET`, `S3_ACCESS_KEY`, `S3_SECRET_KEY`, `S3_PATH_STYLE` - S3 blob backend
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILTER` - Logging

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
