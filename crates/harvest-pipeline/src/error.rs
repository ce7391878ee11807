//! Error types for the item-processing pipeline
//!
//! Stage errors carry enough context to be reported as part of a
//! [`PipelineOutcome`](crate::outcome::PipelineOutcome), so they are
//! `Clone` and serializable. Backend errors that wrap I/O sources
//! ([`BlobError`]) are flattened to text before they reach an outcome.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::plan::StageKind;

/// Why a single fetch attempt (or the whole fetch) failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchCause {
    /// Attempt exceeded `attempt_timeout`
    Timeout,
    /// Connection could not be established or was reset
    Connect { message: String },
    /// Remote answered with a non-success status
    Status { code: u16 },
    /// Body shorter than the declared `Content-Length`
    Truncated { expected: u64, received: u64 },
    /// Body read failed mid-stream
    Body { message: String },
    InvalidLocator { message: String },
    UnsupportedScheme { scheme: String },
    TooManyRedirects,
    /// Asset exceeded `max_asset_bytes`
    TooLarge { limit: u64 },
    /// Fetched bytes could not be written to the blob store
    Blob { message: String },
}

impl FetchCause {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            FetchCause::Timeout
            | FetchCause::Connect { .. }
            | FetchCause::Truncated { .. }
            | FetchCause::Body { .. } => true,
            FetchCause::Status { code } => *code == 429 || (500..600).contains(code),
            FetchCause::InvalidLocator { .. }
            | FetchCause::UnsupportedScheme { .. }
            | FetchCause::TooManyRedirects
            | FetchCause::TooLarge { .. }
            | FetchCause::Blob { .. } => false,
        }
    }
}

impl fmt::Display for FetchCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchCause::Timeout => write!(f, "attempt timed out"),
            FetchCause::Connect { message } => write!(f, "connection failed: {}", message),
            FetchCause::Status { code } => write!(f, "HTTP status {}", code),
            FetchCause::Truncated { expected, received } => {
                write!(f, "truncated body: expected {} bytes, received {}", expected, received)
            },
            FetchCause::Body { message } => write!(f, "failed to read body: {}", message),
            FetchCause::InvalidLocator { message } => write!(f, "invalid locator: {}", message),
            FetchCause::UnsupportedScheme { scheme } => write!(f, "unsupported scheme: {}", scheme),
            FetchCause::TooManyRedirects => write!(f, "redirect limit exceeded"),
            FetchCause::TooLarge { limit } => write!(f, "asset larger than {} bytes", limit),
            FetchCause::Blob { message } => write!(f, "blob store write failed: {}", message),
        }
    }
}

/// Asset could not be retrieved
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("failed to fetch {locator} after {attempts} attempt(s): {cause}")]
pub struct FetchFailed {
    pub locator: String,
    pub cause: FetchCause,
    pub attempts: u32,
}

impl FetchFailed {
    pub fn is_transient(&self) -> bool {
        self.cause.is_transient()
    }
}

/// Fetched asset could not be decoded as an image
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("failed to decode {hash}: {message}")]
pub struct DecodeFailed {
    pub hash: String,
    pub message: String,
}

/// Error reported by an [`EntityStore`](crate::store::EntityStore) backend
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StoreError {
    /// Retrying may succeed (connection loss, serialization conflict, pool timeout)
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("permanent storage error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Writer gave up on a record
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("write failed after {attempts} attempt(s): {cause}")]
pub struct WriteFailed {
    pub cause: StoreError,
    pub attempts: u32,
}

/// Error from a [`BlobStore`](crate::blob::BlobStore) backend
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("S3 error for {key}: {message}")]
    S3 { key: String, message: String },
}

/// Raw record rejected at admission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing identity field: {0}")]
    MissingIdentityField(String),

    #[error("identity field {0} must be text or a number")]
    InvalidIdentityField(String),
}

/// Configuration rejected while resolving the execution plan
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("stage {0} listed more than once")]
    DuplicateStage(StageKind),

    #[error("stage {stage} must come before {after}")]
    OutOfOrder { stage: StageKind, after: StageKind },

    #[error("stage {stage} requires stage {requires}")]
    MissingDependency { stage: StageKind, requires: StageKind },

    #[error("invalid validation rule {name}: {message}")]
    InvalidRule { name: String, message: String },

    #[error("invalid thumbnail {name}: {message}")]
    InvalidThumbnail { name: String, message: String },

    #[error("{0}")]
    Invalid(String),
}

/// Pipeline could not be built or did not shut down cleanly
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("dispatcher task failed: {0}")]
    Dispatcher(String),
}

/// Record could not be handed to the pipeline
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("record rejected: {0}")]
    Rejected(#[from] RecordError),

    #[error("run cancelled, record refused")]
    Cancelled,

    #[error("pipeline is no longer accepting records")]
    Closed,
}
