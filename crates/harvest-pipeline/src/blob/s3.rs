//! S3 / MinIO blob store

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use tracing::{debug, info, instrument};

use super::{BlobStore, StoreFormat, StoreLayout};
use crate::config::S3Config;
use crate::error::BlobError;

#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    layout: StoreLayout,
}

impl S3BlobStore {
    pub async fn new(config: &S3Config, format: StoreFormat) -> Self {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing S3 blob store");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.path_style);

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials =
                Credentials::new(access_key, secret_key, None, None, "harvest-blob-store");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        }

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, "S3 blob store initialized");

        Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            layout: StoreLayout::new(format),
        }
    }

    /// Object key for a layout path
    pub fn key(&self, path: &str) -> String {
        object_key(self.prefix.as_deref(), path)
    }
}

fn object_key(prefix: Option<&str>, path: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, path),
        _ => path.to_string(),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn layout(&self) -> StoreLayout {
        self.layout
    }

    fn backend(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self, bytes), fields(bucket = %self.bucket))]
    async fn write_object(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), BlobError> {
        let key = self.key(path);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request.send().await.map_err(|e| BlobError::S3 {
            key: key.clone(),
            message: e.to_string(),
        })?;

        debug!(key = %key, bytes = bytes.len(), "Uploaded blob");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn object_exists(&self, path: &str) -> Result<bool, BlobError> {
        let key = self.key(path);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Ok(false)
                } else {
                    Err(BlobError::S3 {
                        key,
                        message: e.to_string(),
                    })
                }
            },
        }
    }
}
