//! Harvest Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the Harvest workspace.
//!
//! - **Error Handling**: the workspace-wide [`HarvestError`] and [`Result`] alias
//! - **Checksums**: SHA-256 content hashing used for content-addressed assets
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use harvest_common::checksum::sha256_hex;
//!
//! let digest = sha256_hex(b"hello world");
//! assert_eq!(digest.len(), 64);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{HarvestError, Result};
