//! Outcome reporters

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::outcome::{PipelineOutcome, RunSummary};

/// Receives exactly one outcome per record, then the run summary
#[async_trait]
pub trait RunReporter: Send + Sync {
    async fn report(&self, outcome: &PipelineOutcome) -> std::io::Result<()>;

    async fn finish(&self, _summary: &RunSummary) -> std::io::Result<()> {
        Ok(())
    }
}

/// Keeps every outcome in memory
#[derive(Debug, Default)]
pub struct CollectingReporter {
    outcomes: Mutex<Vec<PipelineOutcome>>,
    summary: Mutex<Option<RunSummary>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn outcomes(&self) -> Vec<PipelineOutcome> {
        self.outcomes.lock().await.clone()
    }

    pub async fn summary(&self) -> Option<RunSummary> {
        self.summary.lock().await.clone()
    }
}

#[async_trait]
impl RunReporter for CollectingReporter {
    async fn report(&self, outcome: &PipelineOutcome) -> std::io::Result<()> {
        self.outcomes.lock().await.push(outcome.clone());
        Ok(())
    }

    async fn finish(&self, summary: &RunSummary) -> std::io::Result<()> {
        *self.summary.lock().await = Some(summary.clone());
        Ok(())
    }
}

/// Counts outcomes and keeps nothing else
///
/// Used when a run has no outcome file; the summary already carries the
/// logged details.
#[derive(Debug, Default)]
pub struct DiscardingReporter {
    seen: AtomicU64,
}

impl DiscardingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RunReporter for DiscardingReporter {
    async fn report(&self, _outcome: &PipelineOutcome) -> std::io::Result<()> {
        self.seen.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Writes one JSON object per outcome
pub struct JsonLinesReporter<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesReporter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> RunReporter for JsonLinesReporter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn report(&self, outcome: &PipelineOutcome) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(outcome)?;
        line.push(b'\n');
        self.writer.lock().await.write_all(&line).await
    }

    async fn finish(&self, _summary: &RunSummary) -> std::io::Result<()> {
        self.writer.lock().await.flush().await
    }
}
