//! Pipeline configuration
//!
//! Loaded from a TOML file, then overridden from the environment (after
//! `dotenvy` has read any `.env` file) and validated. Every field has a
//! default, so an empty file is a valid configuration.
//!
//! ```toml
//! identity_fields = ["url"]
//! asset_fields = ["image"]
//! mandatory_fields = ["title"]
//! stages = ["fetch_assets", "thumbnails", "validate", "write"]
//!
//! [concurrency]
//! workers = 8
//!
//! [[images.thumbnails]]
//! name = "medium"
//! width = 50
//! height = 50
//!
//! [[validation.rules]]
//! kind = "url"
//! field = "url"
//! ```

use anyhow::Context;
use harvest_common::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::blob::StoreFormat;
use crate::error::ConfigError;
use crate::plan::{ExecutionPlan, StageKind};
use crate::thumbnail::ThumbnailSpec;
use crate::validation::RuleConfig;

// ============================================================================
// Defaults
// ============================================================================

/// Default number of records processed concurrently
pub const DEFAULT_WORKERS: usize = 8;

/// Default capacity of the submission queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default number of concurrent asset downloads across all records
pub const DEFAULT_FETCH_CONCURRENCY: usize = 16;

/// Default number of concurrent thumbnail jobs on the blocking pool
pub const DEFAULT_CPU_CONCURRENCY: usize = 4;

pub const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_FETCH_INITIAL_BACKOFF_MS: u64 = 500;
pub const DEFAULT_FETCH_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Default upper bound on a single asset (20 MiB)
pub const DEFAULT_MAX_ASSET_BYTES: u64 = 20 * 1024 * 1024;

pub const DEFAULT_USER_AGENT: &str = concat!("harvest/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_WRITE_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_WRITE_INITIAL_BACKOFF_MS: u64 = 200;

/// Default number of individually logged outcomes per run
pub const DEFAULT_LOG_LIMIT: usize = 5;

/// Default local directory for originals and thumbnails
pub const DEFAULT_IMAGES_STORE: &str = "./media";

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/harvest";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const DEFAULT_S3_BUCKET: &str = "harvest-media";

fn default_identity_fields() -> Vec<String> {
    vec!["url".to_string()]
}

fn default_asset_fields() -> Vec<String> {
    vec!["image".to_string()]
}

fn default_stages() -> Vec<String> {
    StageKind::ALL.iter().map(|s| s.as_str().to_string()).collect()
}

fn default_thumbnails() -> Vec<ThumbnailSpec> {
    vec![
        ThumbnailSpec::new("medium", 50, 50),
        ThumbnailSpec::new("small", 25, 25),
    ]
}

// ============================================================================
// Configuration types
// ============================================================================

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Fields whose values form the identity key, in order
    pub identity_fields: Vec<String>,
    /// Fields holding asset locators
    pub asset_fields: Vec<String>,
    /// Shorthand for one required `present` rule per field
    pub mandatory_fields: Vec<String>,
    /// Enabled stages in execution order
    pub stages: Vec<String>,
    /// Deadline for fetching, thumbnailing and validating one record
    pub record_timeout_secs: Option<u64>,
    pub concurrency: ConcurrencyConfig,
    pub fetch: FetchConfig,
    pub images: ImagesConfig,
    pub validation: ValidationConfig,
    pub write: WriteConfig,
    pub policy: PolicyConfig,
    pub log: LogLimitConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencyConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub fetch_concurrency: usize,
    pub cpu_concurrency: usize,
}

/// Asset download behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_secs: u64,
    pub allow_redirects: bool,
    pub max_redirects: usize,
    pub max_asset_bytes: u64,
    pub user_agent: String,
}

impl FetchConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagesConfig {
    /// Root directory of the filesystem blob store
    pub store: PathBuf,
    pub store_format: StoreFormat,
    /// Thumbnail variants, in declaration order
    pub thumbnails: Vec<ThumbnailSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriteConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl WriteConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// What happens to a record whose asset cannot be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPolicy {
    /// Record is Errored at the fetch stage
    #[default]
    Error,
    /// Record is Dropped
    Drop,
    /// Asset field is removed and the record continues with a warning
    SkipAsset,
}

/// What happens to a record whose asset cannot be decoded for thumbnails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Record continues without thumbnails for that asset
    #[default]
    Continue,
    Drop,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub fetch: FetchPolicy,
    pub decode: DecodePolicy,
}

/// Per-run limit on individually logged outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogLimitConfig {
    /// Log individual outcomes at all
    pub enabled: bool,
    /// Minimum outcome level that counts against the limit
    pub level: LogLevel,
    pub limit: usize,
}

/// Entity storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityBackend {
    #[default]
    Memory,
    Postgres,
}

/// Blob storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackend {
    #[default]
    Fs,
    S3,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: EntityBackend,
    pub blob: BlobBackend,
    pub database: DatabaseConfig,
    pub s3: S3Config,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// S3 / MinIO configuration
///
/// Without explicit keys the default AWS credential chain is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
    /// Key prefix prepended to every blob path
    pub prefix: Option<String>,
}

// ============================================================================
// Default impls
// ============================================================================

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            identity_fields: default_identity_fields(),
            asset_fields: default_asset_fields(),
            mandatory_fields: Vec::new(),
            stages: default_stages(),
            record_timeout_secs: None,
            concurrency: ConcurrencyConfig::default(),
            fetch: FetchConfig::default(),
            images: ImagesConfig::default(),
            validation: ValidationConfig::default(),
            write: WriteConfig::default(),
            policy: PolicyConfig::default(),
            log: LogLimitConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            cpu_concurrency: DEFAULT_CPU_CONCURRENCY,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_FETCH_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_FETCH_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_FETCH_MAX_BACKOFF_MS,
            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT_SECS,
            allow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            store: PathBuf::from(DEFAULT_IMAGES_STORE),
            store_format: StoreFormat::default(),
            thumbnails: default_thumbnails(),
        }
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_WRITE_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_WRITE_INITIAL_BACKOFF_MS,
        }
    }
}

impl Default for LogLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::Error,
            limit: DEFAULT_LOG_LIMIT,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_S3_REGION.to_string(),
            bucket: DEFAULT_S3_BUCKET.to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
            prefix: None,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl PipelineConfig {
    /// Load configuration from a TOML file, the environment and defaults
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration text without consulting the environment
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("Invalid pipeline configuration")
    }

    /// Apply environment-style overrides through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());

        if let Some(workers) = parse("HARVEST_WORKERS") {
            self.concurrency.workers = workers;
        }
        if let Some(capacity) = parse("HARVEST_QUEUE_CAPACITY") {
            self.concurrency.queue_capacity = capacity;
        }
        if let Some(fetch) = parse("HARVEST_FETCH_CONCURRENCY") {
            self.concurrency.fetch_concurrency = fetch;
        }
        if let Some(cpu) = parse("HARVEST_CPU_CONCURRENCY") {
            self.concurrency.cpu_concurrency = cpu;
        }
        if let Some(limit) = parse("HARVEST_LOG_LIMIT") {
            self.log.limit = limit;
        }
        if let Some(store) = lookup("HARVEST_IMAGES_STORE") {
            self.images.store = PathBuf::from(store);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.storage.database.url = url;
        }
        if let Some(endpoint) = lookup("S3_ENDPOINT") {
            self.storage.s3.endpoint = Some(endpoint);
        }
        if let Some(region) = lookup("S3_REGION") {
            self.storage.s3.region = region;
        }
        if let Some(bucket) = lookup("S3_BUCKET") {
            self.storage.s3.bucket = bucket;
        }
        if let Some(key) = lookup("S3_ACCESS_KEY") {
            self.storage.s3.access_key = Some(key);
        }
        if let Some(secret) = lookup("S3_SECRET_KEY") {
            self.storage.s3.secret_key = Some(secret);
        }
        if let Some(path_style) = lookup("S3_PATH_STYLE").and_then(|v| v.parse().ok()) {
            self.storage.s3.path_style = path_style;
        }
    }

    /// Validate configuration values that do not depend on plan resolution
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_fields.is_empty() {
            return Err(ConfigError::Invalid(
                "identity_fields must name at least one field".to_string(),
            ));
        }

        let concurrency = &self.concurrency;
        for (name, value) in [
            ("workers", concurrency.workers),
            ("queue_capacity", concurrency.queue_capacity),
            ("fetch_concurrency", concurrency.fetch_concurrency),
            ("cpu_concurrency", concurrency.cpu_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "concurrency.{} must be greater than 0",
                    name
                )));
            }
        }

        if self.fetch.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "fetch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.fetch.initial_backoff_ms > self.fetch.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "fetch.initial_backoff_ms ({}) cannot be greater than fetch.max_backoff_ms ({})",
                self.fetch.initial_backoff_ms, self.fetch.max_backoff_ms
            )));
        }
        if self.fetch.attempt_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch.attempt_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.write.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "write.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.record_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "record_timeout_secs must be greater than 0 when set".to_string(),
            ));
        }

        if self.storage.backend == EntityBackend::Postgres {
            let db = &self.storage.database;
            if db.url.is_empty() {
                return Err(ConfigError::Invalid("Database URL cannot be empty".to_string()));
            }
            if db.max_connections == 0 {
                return Err(ConfigError::Invalid(
                    "Database max_connections must be greater than 0".to_string(),
                ));
            }
            if db.min_connections > db.max_connections {
                return Err(ConfigError::Invalid(format!(
                    "Database min_connections ({}) cannot be greater than max_connections ({})",
                    db.min_connections, db.max_connections
                )));
            }
        }

        if self.storage.blob == BlobBackend::S3 && self.storage.s3.bucket.is_empty() {
            return Err(ConfigError::Invalid("S3 bucket cannot be empty".to_string()));
        }
        if self.storage.s3.access_key.is_some() != self.storage.s3.secret_key.is_some() {
            return Err(ConfigError::Invalid(
                "S3 access_key and secret_key must be set together".to_string(),
            ));
        }

        if self.log.enabled && self.log.limit == 0 {
            tracing::warn!("log.limit is 0 - no outcome will be logged individually");
        }

        Ok(())
    }

    pub fn record_timeout(&self) -> Option<Duration> {
        self.record_timeout_secs.map(Duration::from_secs)
    }

    /// Resolve the execution plan described by this configuration
    pub fn plan(&self) -> Result<ExecutionPlan, ConfigError> {
        ExecutionPlan::resolve(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_is_default() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config.identity_fields, vec!["url"]);
        assert_eq!(config.stages.len(), 4);
        assert_eq!(config.concurrency.workers, DEFAULT_WORKERS);
        assert_eq!(config.fetch.max_redirects, DEFAULT_MAX_REDIRECTS);
        assert!(config.fetch.allow_redirects);
        assert_eq!(config.images.store_format, StoreFormat::All);
        assert_eq!(config.images.thumbnails.len(), 2);
        assert_eq!(config.log.level, LogLevel::Error);
        assert_eq!(config.log.limit, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_file() {
        let config = PipelineConfig::from_toml_str(
            r#"
            identity_fields = ["url", "lang"]
            mandatory_fields = ["title"]
            stages = ["validate", "write"]
            record_timeout_secs = 60

            [concurrency]
            workers = 2
            fetch_concurrency = 4

            [fetch]
            max_attempts = 5
            allow_redirects = false

            [images]
            store = "/tmp/media"
            store_format = "flat"

            [[images.thumbnails]]
            name = "big"
            width = 200
            height = 100

            [[validation.rules]]
            kind = "pattern"
            field = "sku"
            regex = "^[A-Z]{3}-\\d+$"
            severity = "advisory"

            [policy]
            fetch = "skip_asset"
            decode = "drop"

            [log]
            level = "warning"
            limit = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.identity_fields, vec!["url", "lang"]);
        assert_eq!(config.concurrency.workers, 2);
        assert_eq!(config.concurrency.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.fetch.max_attempts, 5);
        assert!(!config.fetch.allow_redirects);
        assert_eq!(config.images.store_format, StoreFormat::Flat);
        assert_eq!(config.images.thumbnails, vec![ThumbnailSpec::new("big", 200, 100)]);
        assert_eq!(config.validation.rules.len(), 1);
        assert_eq!(config.policy.fetch, FetchPolicy::SkipAsset);
        assert_eq!(config.policy.decode, DecodePolicy::Drop);
        assert_eq!(config.log.level, LogLevel::Warn);
        assert_eq!(config.record_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(PipelineConfig::from_toml_str("[concurrency]\nthreads = 4\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HARVEST_WORKERS", "3"),
            ("HARVEST_LOG_LIMIT", "12"),
            ("HARVEST_IMAGES_STORE", "/data/images"),
            ("DATABASE_URL", "postgresql://db/harvest"),
            ("HARVEST_FETCH_CONCURRENCY", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.concurrency.workers, 3);
        assert_eq!(config.log.limit, 12);
        assert_eq!(config.images.store, PathBuf::from("/data/images"));
        assert_eq!(config.storage.database.url, "postgresql://db/harvest");
        assert_eq!(config.concurrency.fetch_concurrency, DEFAULT_FETCH_CONCURRENCY);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.concurrency.workers = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.fetch.initial_backoff_ms = 10_000;
        config.fetch.max_backoff_ms = 1_000;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.identity_fields.clear();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.storage.backend = EntityBackend::Postgres;
        config.storage.database.min_connections = 20;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.storage.s3.access_key = Some("key".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.toml");
        std::fs::write(&path, "[write]\nmax_attempts = 7\n").unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.write.max_attempts, 7);

        assert!(PipelineConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
