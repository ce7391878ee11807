//! Deduplicating writer
//!
//! Reconciles a validated record with the stored entity of the same identity
//! key and inserts, updates or leaves it alone. Writes for one key are
//! serialized through [`KeyLocks`]; different keys proceed concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::WriteConfig;
use crate::error::{StoreError, WriteFailed};
use crate::fetcher::backoff_delay;
use crate::outcome::CommitKind;
use crate::record::{IdentityKey, Record};
use crate::store::{EntityStore, StoredEntity};

/// Upper bound on the delay between write attempts
pub const MAX_WRITE_BACKOFF: Duration = Duration::from_secs(10);

type LockMap = HashMap<IdentityKey, Arc<AsyncMutex<()>>>;

/// Per-key async mutexes, pruned when no task holds or awaits them
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &IdentityKey) -> KeyGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(key.clone()).or_default())
        };

        let guard = mutex.lock_owned().await;
        KeyGuard {
            guard: Some(guard),
            key: key.clone(),
            locks: self.clone(),
        }
    }

    /// Keys currently held or awaited
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &IdentityKey) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map's own reference left: nobody holds or waits on it
        if map.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(key);
        }
    }
}

/// Exclusive access to one identity key
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: IdentityKey,
    locks: KeyLocks,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Unlock first so the guard's Arc is gone before the prune check
        drop(self.guard.take());
        self.locks.release(&self.key);
    }
}

pub struct DeduplicatingWriter {
    store: Arc<dyn EntityStore>,
    locks: KeyLocks,
    config: WriteConfig,
}

impl DeduplicatingWriter {
    pub fn new(store: Arc<dyn EntityStore>, config: WriteConfig) -> Self {
        Self {
            store,
            locks: KeyLocks::new(),
            config,
        }
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Commit `record`, retrying transient storage errors
    pub async fn write(&self, record: &Record) -> Result<CommitKind, WriteFailed> {
        let key = record.identity();
        let _guard = self.locks.lock(key).await;

        let max_attempts = self.config.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.reconcile(record).await {
                Ok(kind) => {
                    debug!(identity_key = %key, ?kind, backend = self.store.backend(), "Record written");
                    return Ok(kind);
                },
                Err(cause) if cause.is_transient() && attempt < max_attempts => {
                    let delay =
                        backoff_delay(self.config.initial_backoff(), MAX_WRITE_BACKOFF, attempt);
                    debug!(
                        identity_key = %key,
                        attempt,
                        max_attempts,
                        error = %cause,
                        delay_ms = delay.as_millis() as u64,
                        "Transient write failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(cause) => {
                    return Err(WriteFailed {
                        cause,
                        attempts: attempt,
                    })
                },
            }
        }
    }

    async fn reconcile(&self, record: &Record) -> Result<CommitKind, StoreError> {
        match self.store.lookup(record.identity()).await? {
            None => {
                self.store
                    .insert_or_update(&StoredEntity::from_record(record))
                    .await?;
                Ok(CommitKind::Inserted)
            },
            Some(existing) => {
                let merged = existing.merged_with(record);
                if merged == existing {
                    return Ok(CommitKind::Unchanged);
                }
                self.store.insert_or_update(&merged).await?;
                Ok(CommitKind::Updated)
            },
        }
    }
}
