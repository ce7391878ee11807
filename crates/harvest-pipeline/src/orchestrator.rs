//! Pipeline orchestrator
//!
//! Records enter through a bounded queue ([`PipelineHandle::submit`]) and are
//! processed by at most `workers` concurrent tasks. Each task walks the
//! record through the enabled stages strictly in plan order:
//!
//! ```text
//! Fetching -> Thumbnailing -> Validating -> Writing -> {Committed | Dropped | Errored}
//! ```
//!
//! Cancellation and the record deadline are checked at every stage entry.
//! The deadline also bounds the fetch and thumbnail stages while they run;
//! a write, once started, always completes.

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::blob::BlobStore;
use crate::config::{DecodePolicy, FetchPolicy, PipelineConfig};
use crate::error::{PipelineError, RecordError, SubmitError};
use crate::fetcher::{AssetFetcher, FetchedAsset};
use crate::limiter::{LogDecision, LogLimiter};
use crate::outcome::{
    CommitKind, DropReason, ErrorCause, OutcomeWarning, PipelineOutcome, RunSummary,
};
use crate::plan::{ExecutionPlan, StageKind};
use crate::record::{AssetReference, FieldValue, IdentityKey, RawRecord, Record, RecordSchema};
use crate::reporter::RunReporter;
use crate::store::EntityStore;
use crate::thumbnail::{ThumbnailError, ThumbnailGenerator};
use crate::writer::DeduplicatingWriter;
use harvest_common::logging::LogLevel;

/// Why a record stopped before the end of the plan
enum Halt {
    Dropped(DropReason),
    Errored(ErrorCause),
}

struct Inner {
    plan: ExecutionPlan,
    fetcher: Option<AssetFetcher>,
    thumbnails: Option<ThumbnailGenerator>,
    writer: Option<DeduplicatingWriter>,
    reporter: Arc<dyn RunReporter>,
    limiter: LogLimiter,
    workers: usize,
    queue_capacity: usize,
    cancel: CancellationToken,
}

/// A configured pipeline for one run
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        blobs: Arc<dyn BlobStore>,
        store: Arc<dyn EntityStore>,
        reporter: Arc<dyn RunReporter>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let plan = config.plan()?;

        if blobs.layout().format() != plan.store_format {
            warn!(
                configured = %plan.store_format,
                blob_store = %blobs.layout().format(),
                "Blob store layout differs from the configured store format"
            );
        }

        let fetcher = if plan.is_enabled(StageKind::FetchAssets) {
            Some(AssetFetcher::new(
                config.fetch.clone(),
                config.concurrency.fetch_concurrency,
                Arc::clone(&blobs),
            )?)
        } else {
            None
        };

        let thumbnails = if plan.is_enabled(StageKind::Thumbnails) {
            Some(ThumbnailGenerator::new(
                plan.thumbnails.clone(),
                config.concurrency.cpu_concurrency,
                blobs,
            ))
        } else {
            None
        };

        let writer = if plan.is_enabled(StageKind::Write) {
            Some(DeduplicatingWriter::new(store, config.write.clone()))
        } else {
            None
        };

        info!(
            stages = ?plan.stages(),
            workers = config.concurrency.workers,
            queue_capacity = config.concurrency.queue_capacity,
            "Pipeline ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                plan,
                fetcher,
                thumbnails,
                writer,
                reporter,
                limiter: LogLimiter::new(&config.log),
                workers: config.concurrency.workers,
                queue_capacity: config.concurrency.queue_capacity,
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.inner.plan
    }

    /// Token that cancels this run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Build a record from raw extracted data
    pub fn admit(&self, raw: RawRecord) -> Result<Record, RecordError> {
        Record::from_raw(raw, &self.inner.plan.schema)
    }

    /// Start the dispatcher and return the submission handle
    pub fn start(self) -> PipelineHandle {
        let (sender, receiver) = mpsc::channel(self.inner.queue_capacity);
        let schema = self.inner.plan.schema.clone();
        let cancel = self.inner.cancel.clone();
        let dispatcher = tokio::spawn(self.dispatch(receiver));

        PipelineHandle {
            sender,
            schema,
            cancel,
            dispatcher,
        }
    }

    /// Walk one record through every enabled stage
    pub async fn process_record(&self, mut record: Record) -> PipelineOutcome {
        let inner = &self.inner;
        let key = record.identity().clone();
        let deadline = inner.plan.record_timeout.map(|timeout| Instant::now() + timeout);
        let mut warnings = Vec::new();
        let mut fetched = Vec::new();

        for &stage in inner.plan.stages() {
            if inner.cancel.is_cancelled() {
                return PipelineOutcome::errored(key, stage, ErrorCause::Cancelled, warnings);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return PipelineOutcome::errored(key, stage, ErrorCause::Timeout, warnings);
            }

            debug!(state = stage.state_name(), "Entering stage");

            let result = match stage {
                StageKind::FetchAssets => {
                    within(deadline, self.fetch_assets(&mut record, &mut fetched, &mut warnings))
                        .await
                },
                StageKind::Thumbnails => {
                    within(
                        deadline,
                        self.generate_thumbnails(&mut record, &fetched, &mut warnings),
                    )
                    .await
                },
                StageKind::Validate => self.validate(&record, &mut warnings),
                StageKind::Write => match self.write(&record).await {
                    Ok(commit) => return PipelineOutcome::committed(key, commit, warnings),
                    Err(halt) => Err(halt),
                },
            };

            match result {
                Ok(()) => {},
                Err(Halt::Dropped(reason)) => {
                    return PipelineOutcome::dropped(key, reason, warnings);
                },
                Err(Halt::Errored(cause)) => {
                    return PipelineOutcome::errored(key, stage, cause, warnings);
                },
            }
        }

        PipelineOutcome::committed(key, CommitKind::Skipped, warnings)
    }

    async fn fetch_assets(
        &self,
        record: &mut Record,
        fetched: &mut Vec<(String, FetchedAsset)>,
        warnings: &mut Vec<OutcomeWarning>,
    ) -> Result<(), Halt> {
        let Some(fetcher) = &self.inner.fetcher else {
            return Ok(());
        };

        let pending = record.pending_assets();
        if pending.is_empty() {
            return Ok(());
        }

        let results = join_all(pending.into_iter().map(|(field, locator)| async move {
            let result = fetcher.fetch(&locator).await;
            (field, result)
        }))
        .await;

        let policy = self.inner.plan.fetch_policy;
        let mut failure = None;

        for (field, result) in results {
            match result {
                Ok(asset) => {
                    record.insert(
                        field.clone(),
                        FieldValue::Asset(AssetReference::Resolved(asset.asset.clone())),
                    );
                    fetched.push((field, asset));
                },
                Err(error) if policy == FetchPolicy::SkipAsset => {
                    debug!(%field, error = %error, "Skipping asset");
                    record.remove(&field);
                    warnings.push(OutcomeWarning::AssetSkipped { field, error });
                },
                Err(error) => {
                    failure.get_or_insert(error);
                },
            }
        }

        match failure {
            None => Ok(()),
            Some(error) if policy == FetchPolicy::Drop => {
                Err(Halt::Dropped(DropReason::FetchFailed(error)))
            },
            Some(error) => Err(Halt::Errored(ErrorCause::FetchFailed(error))),
        }
    }

    async fn generate_thumbnails(
        &self,
        record: &mut Record,
        fetched: &[(String, FetchedAsset)],
        warnings: &mut Vec<OutcomeWarning>,
    ) -> Result<(), Halt> {
        let Some(generator) = &self.inner.thumbnails else {
            return Ok(());
        };

        let results = join_all(fetched.iter().map(|(field, asset)| async move {
            let result = generator
                .generate(&asset.asset, Arc::clone(&asset.bytes))
                .await;
            (field, result)
        }))
        .await;

        let plan = &self.inner.plan;
        let first_thumbnail = plan.thumbnails.first().map(|spec| spec.name.as_str());

        for (field, result) in results {
            match result {
                Ok(paths) => attach_thumbnails(record, field, paths, first_thumbnail, plan),
                Err(ThumbnailError::Decode(error)) => match plan.decode_policy {
                    DecodePolicy::Continue => {
                        debug!(%field, error = %error, "Continuing without thumbnails");
                        warnings.push(OutcomeWarning::DecodeFailed {
                            field: field.clone(),
                            error,
                        });
                    },
                    DecodePolicy::Drop => {
                        return Err(Halt::Dropped(DropReason::DecodeFailed(error)));
                    },
                },
                Err(ThumbnailError::Store {
                    name,
                    source,
                    stored,
                }) => {
                    debug!(%field, thumbnail = %name, error = %source, "Thumbnail not stored");
                    attach_thumbnails(record, field, stored, first_thumbnail, plan);
                    warnings.push(OutcomeWarning::ThumbnailStoreFailed {
                        field: field.clone(),
                        thumbnail: name,
                        message: source.to_string(),
                    });
                },
            }
        }

        Ok(())
    }

    fn validate(&self, record: &Record, warnings: &mut Vec<OutcomeWarning>) -> Result<(), Halt> {
        let report = self.inner.plan.validator.validate(record);
        if report.is_rejected() {
            return Err(Halt::Dropped(DropReason::ValidationFailed {
                failures: report.failures,
            }));
        }

        let advisory: Vec<_> = report.advisory().cloned().collect();
        if !advisory.is_empty() {
            warnings.push(OutcomeWarning::Advisory { failures: advisory });
        }
        Ok(())
    }

    async fn write(&self, record: &Record) -> Result<CommitKind, Halt> {
        let Some(writer) = &self.inner.writer else {
            return Ok(CommitKind::Skipped);
        };
        writer
            .write(record)
            .await
            .map_err(|e| Halt::Errored(ErrorCause::WriteFailed(e)))
    }

    async fn dispatch(self, mut receiver: mpsc::Receiver<Record>) -> RunSummary {
        let started = Instant::now();
        let workers = self.inner.workers;
        let mut summary = RunSummary {
            started_at: Some(Utc::now()),
            ..RunSummary::default()
        };
        let mut tasks: JoinSet<PipelineOutcome> = JoinSet::new();
        let mut running: HashMap<Id, IdentityKey> = HashMap::new();

        'run: loop {
            while tasks.len() >= workers {
                tokio::select! {
                    biased;
                    _ = self.inner.cancel.cancelled() => break 'run,
                    Some(joined) = tasks.join_next_with_id() => {
                        self.complete(joined, &mut running, &mut summary).await;
                    }
                }
            }

            let record = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break 'run,
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    self.complete(joined, &mut running, &mut summary).await;
                    continue 'run;
                }
                received = receiver.recv() => match received {
                    Some(record) => record,
                    None => break 'run,
                },
            };

            let key = record.identity().clone();
            let span = info_span!("record", identity_key = %key);
            let pipeline = self.clone();
            let handle =
                tasks.spawn(async move { pipeline.process_record(record).await }.instrument(span));
            running.insert(handle.id(), key);
        }

        // Refuse further submissions; anything still queued was never admitted
        receiver.close();
        while let Some(record) = receiver.recv().await {
            let outcome = PipelineOutcome::errored(
                record.identity().clone(),
                self.inner.plan.first_stage(),
                ErrorCause::Cancelled,
                Vec::new(),
            );
            self.finalize(outcome, &mut summary).await;
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            self.complete(joined, &mut running, &mut summary).await;
        }

        summary.suppressed = self.inner.limiter.suppressed();
        summary.set_elapsed(started.elapsed());

        if summary.suppressed > 0 {
            warn!(
                suppressed = summary.suppressed,
                "Log limit reached, outcomes beyond the limit were only counted"
            );
        }
        info!(
            total = summary.total,
            committed = summary.committed(),
            dropped = summary.dropped,
            errored = summary.errored,
            elapsed_ms = summary.elapsed_ms,
            "Run finished"
        );

        if let Err(e) = self.inner.reporter.finish(&summary).await {
            warn!(error = %e, "Failed to finalize outcome report");
        }

        summary
    }

    async fn complete(
        &self,
        joined: Result<(Id, PipelineOutcome), JoinError>,
        running: &mut HashMap<Id, IdentityKey>,
        summary: &mut RunSummary,
    ) {
        let outcome = match joined {
            Ok((id, outcome)) => {
                running.remove(&id);
                outcome
            },
            Err(e) => {
                let key = running
                    .remove(&e.id())
                    .unwrap_or_else(|| IdentityKey::from_stored("unknown"));
                error!(identity_key = %key, error = %e, "Record task failed");
                PipelineOutcome::errored(
                    key,
                    self.inner.plan.first_stage(),
                    ErrorCause::Internal {
                        message: e.to_string(),
                    },
                    Vec::new(),
                )
            },
        };

        self.finalize(outcome, summary).await;
    }

    /// Log, count and report one outcome
    async fn finalize(&self, outcome: PipelineOutcome, summary: &mut RunSummary) {
        let decision = self.inner.limiter.admit(outcome.level());
        match decision {
            LogDecision::Detailed => log_outcome(&outcome),
            LogDecision::Quiet => debug!(identity_key = %outcome.identity_key, %outcome, "Record finished"),
            LogDecision::Suppressed => {},
        }

        summary.record(&outcome, decision == LogDecision::Detailed);

        if let Err(e) = self.inner.reporter.report(&outcome).await {
            warn!(identity_key = %outcome.identity_key, error = %e, "Failed to report outcome");
        }
    }
}

/// Record stored thumbnail paths on the resolved asset in `field`
fn attach_thumbnails(
    record: &mut Record,
    field: &str,
    paths: BTreeMap<String, String>,
    first_thumbnail: Option<&str>,
    plan: &ExecutionPlan,
) {
    let Some(asset) = record.resolved_asset_mut(field) else {
        return;
    };
    if plan.store_format.points_to_thumbnail() {
        if let Some(path) = first_thumbnail.and_then(|name| paths.get(name)) {
            asset.path = path.clone();
        }
    }
    asset.thumbnails = paths;
}

fn log_outcome(outcome: &PipelineOutcome) {
    match outcome.level() {
        LogLevel::Error => error!(identity_key = %outcome.identity_key, %outcome, "Record errored"),
        LogLevel::Warn => warn!(identity_key = %outcome.identity_key, %outcome, "Record finished with problems"),
        _ => info!(identity_key = %outcome.identity_key, %outcome, "Record committed"),
    }
}

/// Run a stage under the record deadline, if any
async fn within<F>(deadline: Option<Instant>, stage: F) -> Result<(), Halt>
where
    F: Future<Output = Result<(), Halt>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, stage)
            .await
            .unwrap_or(Err(Halt::Errored(ErrorCause::Timeout))),
        None => stage.await,
    }
}

/// Submission side of a running pipeline
pub struct PipelineHandle {
    sender: mpsc::Sender<Record>,
    schema: RecordSchema,
    cancel: CancellationToken,
    dispatcher: JoinHandle<RunSummary>,
}

impl PipelineHandle {
    /// Admit a raw record and queue it, waiting while the queue is full
    pub async fn submit(&self, raw: RawRecord) -> Result<IdentityKey, SubmitError> {
        let record = Record::from_raw(raw, &self.schema)?;
        self.submit_record(record).await
    }

    /// Queue an already admitted record
    pub async fn submit_record(&self, record: Record) -> Result<IdentityKey, SubmitError> {
        if self.cancel.is_cancelled() {
            return Err(SubmitError::Cancelled);
        }

        let key = record.identity().clone();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SubmitError::Cancelled),
            sent = self.sender.send(record) => match sent {
                Ok(()) => Ok(key),
                Err(_) if self.cancel.is_cancelled() => Err(SubmitError::Cancelled),
                Err(_) => Err(SubmitError::Closed),
            },
        }
    }

    /// Cancel the run
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close the queue, wait for every record and return the run summary
    pub async fn finish(self) -> Result<RunSummary, PipelineError> {
        let PipelineHandle {
            sender, dispatcher, ..
        } = self;
        drop(sender);
        dispatcher
            .await
            .map_err(|e| PipelineError::Dispatcher(e.to_string()))
    }
}
