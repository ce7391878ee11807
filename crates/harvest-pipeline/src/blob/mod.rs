//! Content-addressed blob storage for originals and thumbnails
//!
//! Backends only know how to write and probe opaque object paths. Path
//! derivation lives in [`StoreLayout`] so every backend lays out blobs the
//! same way for a given [`StoreFormat`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BlobError;
use crate::record::ContentHash;

pub mod fs;
pub mod s3;

pub use fs::FsBlobStore;
pub use s3::S3BlobStore;

/// File extension of encoded thumbnails
pub const THUMBNAIL_EXTENSION: &str = "jpg";

/// On-disk layout of originals and thumbnails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFormat {
    /// `<hash>` and `<hash>_<name>.jpg` in one directory
    Flat,
    /// `full/<hash>` and `thumbs/<name>/<hash>.jpg`
    #[default]
    All,
    /// Same layout as `all`; records point at their first thumbnail
    Thumbs,
}

impl StoreFormat {
    /// Whether asset fields should reference a thumbnail instead of the original
    pub fn points_to_thumbnail(self) -> bool {
        matches!(self, StoreFormat::Thumbs)
    }
}

impl fmt::Display for StoreFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreFormat::Flat => write!(f, "flat"),
            StoreFormat::All => write!(f, "all"),
            StoreFormat::Thumbs => write!(f, "thumbs"),
        }
    }
}

/// Deterministic object paths for a store format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLayout {
    format: StoreFormat,
}

impl StoreLayout {
    pub fn new(format: StoreFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> StoreFormat {
        self.format
    }

    /// Path of the original asset
    pub fn original(&self, hash: &ContentHash) -> String {
        match self.format {
            StoreFormat::Flat => hash.to_string(),
            StoreFormat::All | StoreFormat::Thumbs => format!("full/{}", hash),
        }
    }

    /// Path of the thumbnail variant `name`
    pub fn variant(&self, hash: &ContentHash, name: &str) -> String {
        match self.format {
            StoreFormat::Flat => format!("{}_{}.{}", hash, name, THUMBNAIL_EXTENSION),
            StoreFormat::All | StoreFormat::Thumbs => {
                format!("thumbs/{}/{}.{}", name, hash, THUMBNAIL_EXTENSION)
            },
        }
    }
}

/// Content-addressed blob store
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Layout used to derive object paths
    fn layout(&self) -> StoreLayout;

    /// Backend name for logs
    fn backend(&self) -> &'static str;

    /// Write `bytes` at `path`, replacing anything already there
    async fn write_object(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), BlobError>;

    async fn object_exists(&self, path: &str) -> Result<bool, BlobError>;

    /// Store an original at its content address
    async fn put(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(String, ContentHash), BlobError> {
        let hash = ContentHash::of(bytes);
        let path = self.layout().original(&hash);
        self.write_object(&path, bytes, content_type).await?;
        Ok((path, hash))
    }

    /// Whether the original with this hash is already stored
    async fn exists(&self, hash: &ContentHash) -> Result<bool, BlobError> {
        self.object_exists(&self.layout().original(hash)).await
    }

    /// Store a derived variant of the original `hash`
    async fn put_variant(
        &self,
        hash: &ContentHash,
        name: &str,
        bytes: &[u8],
    ) -> Result<String, BlobError> {
        let path = self.layout().variant(hash, name);
        self.write_object(&path, bytes, Some("image/jpeg")).await?;
        Ok(path)
    }
}
