//! Per-record outcomes and the run summary

use chrono::{DateTime, Utc};
use harvest_common::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{DecodeFailed, FetchFailed, WriteFailed};
use crate::plan::StageKind;
use crate::record::IdentityKey;
use crate::validation::RuleFailure;

/// What the writer did with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitKind {
    Inserted,
    Updated,
    /// Merged entity equalled the stored one; nothing was written
    Unchanged,
    /// Write stage disabled; the record passed every enabled stage
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DropReason {
    /// At least one required rule failed
    ValidationFailed { failures: Vec<RuleFailure> },
    /// Asset fetch failed under the `drop` fetch policy
    FetchFailed(FetchFailed),
    /// Asset decode failed under the `drop` decode policy
    DecodeFailed(DecodeFailed),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::ValidationFailed { failures } => {
                let names: Vec<&str> = failures.iter().map(|f| f.rule.as_str()).collect();
                write!(f, "validation failed: {}", names.join(", "))
            },
            DropReason::FetchFailed(e) => write!(f, "{}", e),
            DropReason::DecodeFailed(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorCause {
    FetchFailed(FetchFailed),
    WriteFailed(WriteFailed),
    Timeout,
    Cancelled,
    /// Record task failed unexpectedly
    Internal { message: String },
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::FetchFailed(e) => write!(f, "{}", e),
            ErrorCause::WriteFailed(e) => write!(f, "{}", e),
            ErrorCause::Timeout => write!(f, "record deadline exceeded"),
            ErrorCause::Cancelled => write!(f, "run cancelled"),
            ErrorCause::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

/// Non-fatal problem recorded on an outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeWarning {
    /// Asset field removed under the `skip_asset` fetch policy
    AssetSkipped { field: String, error: FetchFailed },
    /// Asset kept without thumbnails
    DecodeFailed { field: String, error: DecodeFailed },
    ThumbnailStoreFailed {
        field: String,
        thumbnail: String,
        message: String,
    },
    /// Advisory rules that failed
    Advisory { failures: Vec<RuleFailure> },
}

impl fmt::Display for OutcomeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeWarning::AssetSkipped { field, error } => {
                write!(f, "asset {} skipped: {}", field, error)
            },
            OutcomeWarning::DecodeFailed { field, error } => {
                write!(f, "no thumbnails for {}: {}", field, error)
            },
            OutcomeWarning::ThumbnailStoreFailed {
                field,
                thumbnail,
                message,
            } => write!(f, "thumbnail {} of {} not stored: {}", thumbnail, field, message),
            OutcomeWarning::Advisory { failures } => {
                let rendered: Vec<String> = failures.iter().map(|f| f.to_string()).collect();
                write!(f, "advisory rules failed: {}", rendered.join("; "))
            },
        }
    }
}

/// Terminal state of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Committed { commit: CommitKind },
    Dropped { reason: DropReason },
    Errored { stage: StageKind, cause: ErrorCause },
}

/// Exactly one per submitted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub identity_key: IdentityKey,
    #[serde(flatten)]
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<OutcomeWarning>,
}

impl PipelineOutcome {
    pub fn committed(identity_key: IdentityKey, commit: CommitKind, warnings: Vec<OutcomeWarning>) -> Self {
        Self {
            identity_key,
            status: OutcomeStatus::Committed { commit },
            warnings,
        }
    }

    pub fn dropped(identity_key: IdentityKey, reason: DropReason, warnings: Vec<OutcomeWarning>) -> Self {
        Self {
            identity_key,
            status: OutcomeStatus::Dropped { reason },
            warnings,
        }
    }

    pub fn errored(
        identity_key: IdentityKey,
        stage: StageKind,
        cause: ErrorCause,
        warnings: Vec<OutcomeWarning>,
    ) -> Self {
        Self {
            identity_key,
            status: OutcomeStatus::Errored { stage, cause },
            warnings,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.status, OutcomeStatus::Committed { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.status, OutcomeStatus::Dropped { .. })
    }

    pub fn is_errored(&self) -> bool {
        matches!(self.status, OutcomeStatus::Errored { .. })
    }

    pub fn commit_kind(&self) -> Option<CommitKind> {
        match self.status {
            OutcomeStatus::Committed { commit } => Some(commit),
            _ => None,
        }
    }

    /// Severity used by the run log limit
    pub fn level(&self) -> LogLevel {
        match &self.status {
            OutcomeStatus::Errored { .. } => LogLevel::Error,
            OutcomeStatus::Dropped { .. } => LogLevel::Warn,
            OutcomeStatus::Committed { .. } if !self.warnings.is_empty() => LogLevel::Warn,
            OutcomeStatus::Committed { .. } => LogLevel::Info,
        }
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            OutcomeStatus::Committed { commit } => {
                write!(f, "{} committed ({:?})", self.identity_key, commit)?
            },
            OutcomeStatus::Dropped { reason } => {
                write!(f, "{} dropped: {}", self.identity_key, reason)?
            },
            OutcomeStatus::Errored { stage, cause } => write!(
                f,
                "{} errored while {}: {}",
                self.identity_key,
                stage.state_name(),
                cause
            )?,
        }
        for warning in &self.warnings {
            write!(f, "; warning: {}", warning)?;
        }
        Ok(())
    }
}

/// Aggregate counts for one run plus the individually reported outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub errored: usize,
    pub cancelled: usize,
    pub with_warnings: usize,
    /// Outcomes reported in detail, at most the log limit
    pub details: Vec<PipelineOutcome>,
    /// Loggable outcomes beyond the limit, counted only
    pub suppressed: usize,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn committed(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.skipped
    }

    /// Count an outcome; `detailed` keeps a copy for the final report
    pub fn record(&mut self, outcome: &PipelineOutcome, detailed: bool) {
        self.total += 1;
        match &outcome.status {
            OutcomeStatus::Committed { commit } => match commit {
                CommitKind::Inserted => self.inserted += 1,
                CommitKind::Updated => self.updated += 1,
                CommitKind::Unchanged => self.unchanged += 1,
                CommitKind::Skipped => self.skipped += 1,
            },
            OutcomeStatus::Dropped { .. } => self.dropped += 1,
            OutcomeStatus::Errored { cause, .. } => {
                self.errored += 1;
                if matches!(cause, ErrorCause::Cancelled) {
                    self.cancelled += 1;
                }
            },
        }
        if !outcome.warnings.is_empty() {
            self.with_warnings += 1;
        }
        if detailed {
            self.details.push(outcome.clone());
        }
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_ms = elapsed.as_millis() as u64;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} record(s) in {:.2}s: {} committed ({} inserted, {} updated, {} unchanged, {} not written), {} dropped, {} errored ({} cancelled)",
            self.total,
            self.elapsed_ms as f64 / 1000.0,
            self.committed(),
            self.inserted,
            self.updated,
            self.unchanged,
            self.skipped,
            self.dropped,
            self.errored,
            self.cancelled,
        )?;
        if let Some(started_at) = self.started_at {
            writeln!(f, "started at {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        }
        if self.with_warnings > 0 {
            writeln!(f, "{} record(s) carried warnings", self.with_warnings)?;
        }
        for outcome in &self.details {
            writeln!(f, "  - {}", outcome)?;
        }
        if self.suppressed > 0 {
            writeln!(f, "  ... {} more not shown (log limit reached)", self.suppressed)?;
        }
        Ok(())
    }
}
