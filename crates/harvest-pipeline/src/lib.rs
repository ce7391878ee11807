//! Harvest Pipeline
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Staged processing of scraped records: asset fetching, thumbnail
//! generation, validation and deduplicated persistence.
//!
//! # Overview
//!
//! - **Records**: raw extracted data is admitted into typed [`Record`]s keyed by an identity
//! - **Assets**: [`AssetFetcher`] downloads and content-addresses asset locators
//! - **Thumbnails**: [`ThumbnailGenerator`] derives fixed-size JPEG variants
//! - **Validation**: [`Validator`] applies mandatory fields and declarative rules
//! - **Persistence**: [`DeduplicatingWriter`] merges records into one entity per identity
//! - **Orchestration**: [`Pipeline`] runs records concurrently behind a bounded queue
//!
//! # Example
//!
//! ```no_run
//! use harvest_pipeline::{
//!     CollectingReporter, FsBlobStore, MemoryEntityStore, Pipeline, PipelineConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = PipelineConfig::default();
//! let blobs = Arc::new(FsBlobStore::new("./media", config.images.store_format));
//! let store = Arc::new(MemoryEntityStore::new());
//! let reporter = Arc::new(CollectingReporter::new());
//!
//! let handle = Pipeline::new(&config, blobs, store, reporter)?.start();
//! let raw = serde_json::json!({"url": "https://example.com/item/1", "title": "One"});
//! if let Some(raw) = raw.as_object().cloned() {
//!     handle.submit(raw).await?;
//! }
//! let summary = handle.finish().await?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod limiter;
pub mod orchestrator;
pub mod outcome;
pub mod plan;
pub mod record;
pub mod reporter;
pub mod store;
pub mod thumbnail;
pub mod validation;
pub mod writer;

// Re-export commonly used types
pub use blob::{BlobStore, FsBlobStore, S3BlobStore, StoreFormat};
pub use config::PipelineConfig;
pub use error::{ConfigError, FetchFailed, PipelineError, SubmitError};
pub use fetcher::AssetFetcher;
pub use orchestrator::{Pipeline, PipelineHandle};
pub use outcome::{CommitKind, PipelineOutcome, RunSummary};
pub use plan::{ExecutionPlan, StageKind};
pub use record::{IdentityKey, Record};
pub use reporter::{CollectingReporter, DiscardingReporter, JsonLinesReporter, RunReporter};
pub use store::{EntityStore, MemoryEntityStore, PgEntityStore};
pub use thumbnail::ThumbnailGenerator;
pub use validation::Validator;
pub use writer::DeduplicatingWriter;
