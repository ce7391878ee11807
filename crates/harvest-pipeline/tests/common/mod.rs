//! Shared helpers for pipeline integration tests
//!
//! Every test gets its own blob directory and in-memory entity store, and
//! talks to a wiremock server instead of the network.

#![allow(dead_code)]

use anyhow::{Context, Result};
use harvest_pipeline::blob::{FsBlobStore, StoreFormat};
use harvest_pipeline::config::{FetchConfig, PipelineConfig};
use harvest_pipeline::outcome::{PipelineOutcome, RunSummary};
use harvest_pipeline::record::{IdentityKey, RawRecord};
use harvest_pipeline::reporter::CollectingReporter;
use harvest_pipeline::store::MemoryEntityStore;
use harvest_pipeline::Pipeline;
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,harvest_pipeline=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// In-memory log sink for asserting on emitted lines
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Install a WARN-and-above subscriber on the current thread
    pub fn warnings(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut sink) = self.0.lock() {
            sink.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// A PNG with a gradient so resizing has real work to do
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x * 2 % 256) as u8, (y * 3 % 256) as u8, 90])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageOutputFormat::Png)
        .map(|_| out.into_inner())
        .unwrap_or_default()
}

/// Fetch settings that keep retries in the millisecond range
pub fn fast_fetch() -> FetchConfig {
    FetchConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 10,
        attempt_timeout_secs: 5,
        ..FetchConfig::default()
    }
}

/// Default stages with a mandatory title and fast fetch retries
pub fn base_config() -> PipelineConfig {
    PipelineConfig {
        mandatory_fields: vec!["title".to_string()],
        fetch: fast_fetch(),
        ..PipelineConfig::default()
    }
}

pub fn raw(value: serde_json::Value) -> RawRecord {
    value.as_object().cloned().unwrap_or_default()
}

pub fn key_of(url: &str) -> IdentityKey {
    IdentityKey::derive([url])
}

/// Blob directory and entity store that outlive individual runs
pub struct Harness {
    pub dir: TempDir,
    pub blobs: Arc<FsBlobStore>,
    pub store: Arc<MemoryEntityStore>,
}

/// Everything observable about one finished run
pub struct RunResult {
    pub summary: RunSummary,
    pub outcomes: Vec<PipelineOutcome>,
}

impl RunResult {
    pub fn outcome(&self, key: &IdentityKey) -> Option<&PipelineOutcome> {
        self.outcomes.iter().find(|o| &o.identity_key == key)
    }
}

impl Harness {
    pub fn new(format: StoreFormat) -> Result<Self> {
        let dir = tempfile::tempdir().context("Failed to create blob directory")?;
        let blobs = Arc::new(FsBlobStore::new(dir.path(), format));
        Ok(Self {
            dir,
            blobs,
            store: Arc::new(MemoryEntityStore::new()),
        })
    }

    pub fn pipeline(&self, config: &PipelineConfig) -> Result<(Pipeline, Arc<CollectingReporter>)> {
        let reporter = Arc::new(CollectingReporter::new());
        let pipeline = Pipeline::new(
            config,
            self.blobs.clone(),
            self.store.clone(),
            reporter.clone(),
        )?;
        Ok((pipeline, reporter))
    }

    /// Submit `records`, wait for the run and collect its outcomes
    pub async fn run(
        &self,
        config: &PipelineConfig,
        records: Vec<serde_json::Value>,
    ) -> Result<RunResult> {
        let (pipeline, reporter) = self.pipeline(config)?;
        let handle = pipeline.start();
        for record in records {
            handle.submit(raw(record)).await?;
        }
        let summary = handle.finish().await?;
        Ok(RunResult {
            summary,
            outcomes: reporter.outcomes().await,
        })
    }
}
