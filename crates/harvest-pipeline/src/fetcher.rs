//! Asset fetcher
//!
//! Downloads remote assets with a bounded number of attempts, exponential
//! backoff between transient failures and a per-attempt timeout, then stores
//! the bytes in the blob store under their content hash. Concurrency across
//! all records is bounded by one shared semaphore; a permit is held for one
//! attempt only, never across a backoff sleep.

use reqwest::{redirect, Client, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use url::Url;

use crate::blob::BlobStore;
use crate::config::FetchConfig;
use crate::error::{FetchCause, FetchFailed};
use crate::record::{ContentHash, ResolvedAsset};

/// A fetched asset together with its bytes, kept for thumbnailing
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub asset: ResolvedAsset,
    pub bytes: Arc<Vec<u8>>,
    /// The blob already existed and was not rewritten
    pub cache_hit: bool,
}

pub struct AssetFetcher {
    client: Client,
    blobs: Arc<dyn BlobStore>,
    permits: Arc<Semaphore>,
    config: FetchConfig,
}

impl AssetFetcher {
    pub fn new(
        config: FetchConfig,
        fetch_concurrency: usize,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, reqwest::Error> {
        let policy = if config.allow_redirects {
            redirect::Policy::limited(config.max_redirects)
        } else {
            redirect::Policy::none()
        };

        let client = Client::builder()
            .redirect(policy)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            blobs,
            permits: Arc::new(Semaphore::new(fetch_concurrency)),
            config,
        })
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.config.initial_backoff(),
            self.config.max_backoff(),
            attempt,
        )
    }

    /// Fetch `locator`, store it and return the resolved asset
    pub async fn fetch(&self, locator: &str) -> Result<FetchedAsset, FetchFailed> {
        let fail = |cause: FetchCause, attempts: u32| FetchFailed {
            locator: locator.to_string(),
            cause,
            attempts,
        };

        let url = parse_locator(locator).map_err(|cause| fail(cause, 0))?;
        let max_attempts = self.config.max_attempts;

        let mut attempt = 0;
        let (bytes, content_type) = loop {
            attempt += 1;
            debug!(%locator, attempt, max_attempts, "Fetching asset");

            match self.attempt(&url).await {
                Ok(body) => break body,
                Err(cause) if cause.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff_for(attempt);
                    debug!(
                        %locator,
                        attempt,
                        max_attempts,
                        error = %cause,
                        delay_ms = delay.as_millis() as u64,
                        "Transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(cause) => return Err(fail(cause, attempt)),
            }
        };

        let hash = ContentHash::of(&bytes);
        let size = bytes.len() as u64;

        let exists = self
            .blobs
            .exists(&hash)
            .await
            .map_err(|e| fail(FetchCause::Blob { message: e.to_string() }, attempt))?;

        let path = if exists {
            debug!(%locator, hash = %hash.short(), backend = self.blobs.backend(), "Blob cache hit");
            self.blobs.layout().original(&hash)
        } else {
            let (path, _) = self
                .blobs
                .put(&bytes, content_type.as_deref())
                .await
                .map_err(|e| fail(FetchCause::Blob { message: e.to_string() }, attempt))?;
            path
        };

        info!(%locator, hash = %hash.short(), size, attempts = attempt, "Fetched asset");

        Ok(FetchedAsset {
            asset: ResolvedAsset {
                locator: locator.to_string(),
                path,
                hash,
                size,
                content_type,
                thumbnails: Default::default(),
            },
            bytes: Arc::new(bytes),
            cache_hit: exists,
        })
    }

    /// One bounded attempt: request, status check and body read
    async fn attempt(&self, url: &Url) -> Result<(Vec<u8>, Option<String>), FetchCause> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| FetchCause::Connect {
                message: e.to_string(),
            })?;

        let request = async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchCause::Status {
                    code: status.as_u16(),
                });
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            let bytes = read_body(response, self.config.max_asset_bytes).await?;
            Ok((bytes, content_type))
        };

        tokio::time::timeout(self.config.attempt_timeout(), request)
            .await
            .map_err(|_| FetchCause::Timeout)?
    }
}

/// `initial * 2^(attempt - 1)`, capped at `max`
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

fn parse_locator(locator: &str) -> Result<Url, FetchCause> {
    let url = Url::parse(locator).map_err(|e| FetchCause::InvalidLocator {
        message: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchCause::UnsupportedScheme {
            scheme: other.to_string(),
        }),
    }
}

fn map_reqwest_error(error: reqwest::Error) -> FetchCause {
    if error.is_timeout() {
        FetchCause::Timeout
    } else if error.is_redirect() {
        FetchCause::TooManyRedirects
    } else if error.is_builder() {
        FetchCause::InvalidLocator {
            message: error.to_string(),
        }
    } else if error.is_body() || error.is_decode() {
        FetchCause::Body {
            message: error.to_string(),
        }
    } else {
        FetchCause::Connect {
            message: error.to_string(),
        }
    }
}

/// Read the body, enforcing the size limit and the declared length
async fn read_body(mut response: Response, max_bytes: u64) -> Result<Vec<u8>, FetchCause> {
    let declared = response.content_length();
    if let Some(len) = declared {
        if len > max_bytes {
            return Err(FetchCause::TooLarge { limit: max_bytes });
        }
    }

    let capacity = declared.unwrap_or(0).min(max_bytes);
    let mut body = Vec::with_capacity(usize::try_from(capacity).unwrap_or(0));

    while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
        if (body.len() + chunk.len()) as u64 > max_bytes {
            return Err(FetchCause::TooLarge { limit: max_bytes });
        }
        body.extend_from_slice(&chunk);
    }

    if let Some(expected) = declared {
        let received = body.len() as u64;
        if received != expected {
            return Err(FetchCause::Truncated { expected, received });
        }
    }

    Ok(body)
}
