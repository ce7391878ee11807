//! Error types shared across Harvest crates

use thiserror::Error;

/// Result type alias for Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Main error type for Harvest
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
