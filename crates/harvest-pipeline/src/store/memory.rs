//! In-process entity store

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{EntityStore, StoredEntity};
use crate::error::StoreError;
use crate::record::IdentityKey;

/// Entity store backed by a map, counting every mutation
///
/// Failures can be queued with [`MemoryEntityStore::fail_next_writes`] to
/// exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: Mutex<HashMap<IdentityKey, StoredEntity>>,
    pending_failures: Mutex<VecDeque<StoreError>>,
    mutations: AtomicUsize,
    lookups: AtomicUsize,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `insert_or_update` calls
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.entities.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.lock().await.is_empty()
    }

    pub async fn get(&self, key: &IdentityKey) -> Option<StoredEntity> {
        self.entities.lock().await.get(key).cloned()
    }

    /// Make the next writes fail with `errors`, in order
    pub async fn fail_next_writes(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.pending_failures.lock().await.extend(errors);
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn lookup(&self, key: &IdentityKey) -> Result<Option<StoredEntity>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.entities.lock().await.get(key).cloned())
    }

    async fn insert_or_update(&self, entity: &StoredEntity) -> Result<(), StoreError> {
        if let Some(error) = self.pending_failures.lock().await.pop_front() {
            return Err(error);
        }

        self.entities
            .lock()
            .await
            .insert(entity.identity_key.clone(), entity.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
