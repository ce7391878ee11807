//! Durable entity storage
//!
//! The writer only talks to the [`EntityStore`] trait; backends decide how
//! an entity is persisted and whether a failure is worth retrying.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::record::{FieldValue, IdentityKey, Record};

pub mod memory;
pub mod postgres;

pub use memory::MemoryEntityStore;
pub use postgres::PgEntityStore;

/// Durable, deduplicated representation of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub identity_key: IdentityKey,
    pub fields: BTreeMap<String, FieldValue>,
}

impl StoredEntity {
    pub fn from_record(record: &Record) -> Self {
        Self {
            identity_key: record.identity().clone(),
            fields: record.fields().clone(),
        }
    }

    /// Merge a newer record into this entity
    ///
    /// Fields present in `record` win; fields only present here are kept.
    /// Asset references are replaced whole, never merged.
    pub fn merged_with(&self, record: &Record) -> Self {
        let mut fields = self.fields.clone();
        for (name, value) in record.fields() {
            fields.insert(name.clone(), value.clone());
        }
        Self {
            identity_key: self.identity_key.clone(),
            fields,
        }
    }
}

/// Storage layer consumed by the deduplicating writer
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Backend name for logs
    fn backend(&self) -> &'static str;

    async fn lookup(&self, key: &IdentityKey) -> Result<Option<StoredEntity>, StoreError>;

    /// Insert the entity or replace the one stored under the same key
    async fn insert_or_update(&self, entity: &StoredEntity) -> Result<(), StoreError>;
}
