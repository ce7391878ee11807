//! PostgreSQL entity store
//!
//! Entities live in `stored_entities` (see `migrations/`), one row per
//! identity key with the fields as JSONB.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{EntityStore, StoredEntity};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::record::{FieldValue, IdentityKey};

/// SQLSTATE classes and codes worth retrying
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57P01", "57P02", "57P03"];

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, run migrations and build the store
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database connection pool created"
        );

        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("Database migrations applied");

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Classify a sqlx error as transient or permanent
pub fn classify(error: sqlx::Error) -> StoreError {
    let transient = match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            let code: &str = &code;
            TRANSIENT_SQLSTATES.contains(&code) || code.starts_with("08")
        }),
        _ => false,
    };

    if transient {
        StoreError::Transient(error.to_string())
    } else {
        StoreError::Permanent(error.to_string())
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn lookup(&self, key: &IdentityKey) -> Result<Option<StoredEntity>, StoreError> {
        let row: Option<(String, Json<BTreeMap<String, FieldValue>>)> = sqlx::query_as(
            r#"
            SELECT identity_key, fields
            FROM stored_entities
            WHERE identity_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(|(identity_key, Json(fields))| StoredEntity {
            identity_key: IdentityKey::from_stored(identity_key),
            fields,
        }))
    }

    async fn insert_or_update(&self, entity: &StoredEntity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stored_entities (identity_key, fields, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (identity_key)
            DO UPDATE SET
                fields = EXCLUDED.fields,
                updated_at = NOW()
            "#,
        )
        .bind(entity.identity_key.as_str())
        .bind(Json(&entity.fields))
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }
}
