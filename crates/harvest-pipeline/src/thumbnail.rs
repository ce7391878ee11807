//! Thumbnail generation
//!
//! Decoding and resizing run on the blocking pool, gated by a semaphore
//! sized by `cpu_concurrency`.

use harvest_common::checksum::verify_checksum;
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::blob::BlobStore;
use crate::error::{BlobError, DecodeFailed};
use crate::record::ResolvedAsset;

/// JPEG quality of encoded thumbnails
pub const THUMBNAIL_QUALITY: u8 = 85;

/// Named target dimensions for a derived image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThumbnailSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSpec {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
        }
    }
}

#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error(transparent)]
    Decode(#[from] DecodeFailed),

    /// `stored` holds the variants written before `name` failed
    #[error("failed to store thumbnail {name}: {source}")]
    Store {
        name: String,
        #[source]
        source: BlobError,
        stored: BTreeMap<String, String>,
    },
}

pub struct ThumbnailGenerator {
    specs: Arc<Vec<ThumbnailSpec>>,
    blobs: Arc<dyn BlobStore>,
    permits: Arc<Semaphore>,
}

impl ThumbnailGenerator {
    pub fn new(specs: Vec<ThumbnailSpec>, cpu_concurrency: usize, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            specs: Arc::new(specs),
            blobs,
            permits: Arc::new(Semaphore::new(cpu_concurrency)),
        }
    }

    pub fn specs(&self) -> &[ThumbnailSpec] {
        &self.specs
    }

    /// Derive and store every thumbnail of `asset`
    ///
    /// Returns spec name -> blob path. `bytes` must be the asset's content;
    /// they are re-hashed before decoding.
    pub async fn generate(
        &self,
        asset: &ResolvedAsset,
        bytes: Arc<Vec<u8>>,
    ) -> Result<BTreeMap<String, String>, ThumbnailError> {
        if self.specs.is_empty() {
            return Ok(BTreeMap::new());
        }

        if let Some(cached) = self.cached(asset).await {
            debug!(hash = %asset.hash.short(), "Thumbnail cache hit");
            return Ok(cached);
        }

        let decode_failed = |message: String| DecodeFailed {
            hash: asset.hash.to_string(),
            message,
        };

        verify_checksum(&bytes, asset.hash.as_str()).map_err(|e| decode_failed(e.to_string()))?;

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| decode_failed(e.to_string()))?;

        // The permit lives inside the blocking job so an abandoned caller
        // cannot free it while rendering still runs.
        let specs = Arc::clone(&self.specs);
        let rendered = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            render(&bytes, &specs)
        })
        .await
        .map_err(|e| decode_failed(format!("thumbnail task failed: {}", e)))?
        .map_err(decode_failed)?;

        let mut paths = BTreeMap::new();
        for (name, jpeg) in rendered {
            match self.blobs.put_variant(&asset.hash, &name, &jpeg).await {
                Ok(path) => {
                    debug!(hash = %asset.hash.short(), thumbnail = %name, %path, "Stored thumbnail");
                    paths.insert(name, path);
                },
                Err(source) => {
                    return Err(ThumbnailError::Store {
                        name,
                        source,
                        stored: paths,
                    })
                },
            }
        }

        Ok(paths)
    }

    /// Paths of every variant if all of them are already stored
    async fn cached(&self, asset: &ResolvedAsset) -> Option<BTreeMap<String, String>> {
        let layout = self.blobs.layout();
        let mut paths = BTreeMap::new();
        for spec in self.specs.iter() {
            let path = layout.variant(&asset.hash, &spec.name);
            match self.blobs.object_exists(&path).await {
                Ok(true) => {
                    paths.insert(spec.name.clone(), path);
                },
                _ => return None,
            }
        }
        Some(paths)
    }
}

/// Decode once, then resize and JPEG-encode one variant per spec
fn render(bytes: &[u8], specs: &[ThumbnailSpec]) -> Result<Vec<(String, Vec<u8>)>, String> {
    let image = image::load_from_memory(bytes).map_err(|e| e.to_string())?;

    specs
        .iter()
        .map(|spec| {
            let resized = image.resize_exact(spec.width, spec.height, FilterType::Triangle);
            let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

            let mut out = Cursor::new(Vec::new());
            rgb.write_to(&mut out, ImageOutputFormat::Jpeg(THUMBNAIL_QUALITY))
                .map_err(|e| format!("failed to encode {}: {}", spec.name, e))?;
            Ok((spec.name.clone(), out.into_inner()))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::blob::{FsBlobStore, StoreFormat, StoreLayout};
    use crate::record::ContentHash;
    use async_trait::async_trait;
    use image::{GenericImageView, ImageBuffer, Rgba};
    use std::time::Duration;

    /// Filesystem store that refuses objects whose path contains `refuse`
    struct RefusingBlobStore {
        inner: FsBlobStore,
        refuse: &'static str,
    }

    #[async_trait]
    impl BlobStore for RefusingBlobStore {
        fn layout(&self) -> StoreLayout {
            self.inner.layout()
        }

        fn backend(&self) -> &'static str {
            "refusing"
        }

        async fn write_object(
            &self,
            path: &str,
            bytes: &[u8],
            content_type: Option<&str>,
        ) -> Result<(), BlobError> {
            if path.contains(self.refuse) {
                return Err(BlobError::S3 {
                    key: path.to_string(),
                    message: "access denied".to_string(),
                });
            }
            self.inner.write_object(path, bytes, content_type).await
        }

        async fn object_exists(&self, path: &str) -> Result<bool, BlobError> {
            self.inner.object_exists(path).await
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 200])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn resolved(bytes: &[u8]) -> ResolvedAsset {
        let hash = ContentHash::of(bytes);
        ResolvedAsset {
            locator: "http://x/a.png".to_string(),
            path: format!("full/{}", hash),
            hash,
            size: bytes.len() as u64,
            content_type: Some("image/png".to_string()),
            thumbnails: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_generates_exact_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), StoreFormat::All));
        let generator = ThumbnailGenerator::new(
            vec![ThumbnailSpec::new("medium", 50, 50), ThumbnailSpec::new("small", 25, 25)],
            2,
            blobs.clone(),
        );

        let bytes = png_bytes(120, 80);
        let asset = resolved(&bytes);
        let paths = generator.generate(&asset, Arc::new(bytes)).await.unwrap();

        assert_eq!(paths.len(), 2);
        assert_eq!(paths["small"], format!("thumbs/small/{}.jpg", asset.hash));

        let medium = image::open(blobs.resolve(&paths["medium"])).unwrap();
        assert_eq!(medium.dimensions(), (50, 50));
        let small = image::open(blobs.resolve(&paths["small"])).unwrap();
        assert_eq!(small.dimensions(), (25, 25));
    }

    #[tokio::test]
    async fn test_stored_thumbnails_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), StoreFormat::Flat));
        let generator =
            ThumbnailGenerator::new(vec![ThumbnailSpec::new("small", 25, 25)], 1, blobs.clone());

        let bytes = png_bytes(40, 40);
        let asset = resolved(&bytes);
        let first = generator.generate(&asset, Arc::new(bytes.clone())).await.unwrap();

        let path = blobs.resolve(&first["small"]);
        let written = std::fs::metadata(&path).unwrap().modified().unwrap();

        let second = generator.generate(&asset, Arc::new(bytes)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), written);
    }

    #[tokio::test]
    async fn test_corrupt_image_is_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), StoreFormat::All));
        let generator =
            ThumbnailGenerator::new(vec![ThumbnailSpec::new("small", 25, 25)], 1, blobs);

        let bytes = b"definitely not an image".to_vec();
        let asset = resolved(&bytes);
        let err = generator.generate(&asset, Arc::new(bytes)).await.unwrap_err();

        match err {
            ThumbnailError::Decode(decode) => assert_eq!(decode.hash, asset.hash.to_string()),
            other => panic!("expected decode failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mismatched_bytes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), StoreFormat::All));
        let generator =
            ThumbnailGenerator::new(vec![ThumbnailSpec::new("small", 25, 25)], 1, blobs);

        let asset = resolved(&png_bytes(10, 10));
        let err = generator
            .generate(&asset, Arc::new(png_bytes(11, 11)))
            .await
            .unwrap_err();
        assert!(matches!(err, ThumbnailError::Decode(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_partial_store_failure_keeps_written_variants() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(RefusingBlobStore {
            inner: FsBlobStore::new(dir.path(), StoreFormat::All),
            refuse: "/small/",
        });
        let generator = ThumbnailGenerator::new(
            vec![ThumbnailSpec::new("medium", 50, 50), ThumbnailSpec::new("small", 25, 25)],
            1,
            blobs.clone(),
        );

        let bytes = png_bytes(60, 60);
        let asset = resolved(&bytes);
        let err = generator.generate(&asset, Arc::new(bytes)).await.unwrap_err();

        match err {
            ThumbnailError::Store { name, stored, .. } => {
                assert_eq!(name, "small");
                assert_eq!(stored.len(), 1);
                assert_eq!(stored["medium"], format!("thumbs/medium/{}.jpg", asset.hash));
                assert!(blobs.inner.resolve(&stored["medium"]).exists());
            },
            other => panic!("expected store failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abandoned_render_keeps_cpu_permit() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), StoreFormat::All));
        let generator =
            ThumbnailGenerator::new(vec![ThumbnailSpec::new("large", 1500, 1500)], 1, blobs);

        let bytes = png_bytes(2000, 2000);
        let asset = resolved(&bytes);

        let mut pending = Box::pin(generator.generate(&asset, Arc::new(bytes)));
        let rendering = async {
            while generator.permits.available_permits() > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::select! {
            _ = &mut pending => panic!("render finished before the caller gave up"),
            _ = rendering => {},
        }
        drop(pending);
        assert_eq!(generator.permits.available_permits(), 0);

        let released = tokio::time::timeout(Duration::from_secs(60), async {
            while generator.permits.available_permits() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok());
    }
}
