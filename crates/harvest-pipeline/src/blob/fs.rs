//! Local directory blob store

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{BlobStore, StoreFormat, StoreLayout};
use crate::error::BlobError;

static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Blob store rooted at a local directory
///
/// Objects are written to a uniquely named `.partial` file and renamed into
/// place, so a reader never observes a half-written blob.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    layout: StoreLayout,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, format: StoreFormat) -> Self {
        Self {
            root: root.into(),
            layout: StoreLayout::new(format),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of an object path
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> BlobError {
    BlobError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn layout(&self) -> StoreLayout {
        self.layout
    }

    fn backend(&self) -> &'static str {
        "fs"
    }

    async fn write_object(
        &self,
        path: &str,
        bytes: &[u8],
        _content_type: Option<&str>,
    ) -> Result<(), BlobError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let partial = target.with_extension(format!(
            "{}.partial",
            PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| io_error(&partial, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| io_error(&partial, e))?;
        file.sync_all().await.map_err(|e| io_error(&partial, e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(io_error(&target, e));
        }

        debug!(path = %target.display(), bytes = bytes.len(), "Wrote blob");
        Ok(())
    }

    async fn object_exists(&self, path: &str) -> Result<bool, BlobError> {
        let target = self.resolve(path);
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| io_error(&target, e))
    }
}
