//! Artifact storage.
//!
//! [`ArtifactStore`] is the seam to the blob backend. Missing keys are plain
//! `Ok(None)`; every other failure is a [`StoreError`] that callers downgrade
//! to a cache miss.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use thiserror::Error;
use tracing::debug;

use super::config::CacheConfig;
use super::keys::StorageKey;
use super::lock::{rw_read, rw_write};
use super::record::{ArtifactRecord, RecordError};
use crate::util::clock::now_millis;

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failure for `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl StoreError {
    pub fn io(key: &StorageKey, source: std::io::Error) -> Self {
        Self::Io {
            key: key.object_path(),
            source,
        }
    }
}

/// A value together with its write time in epoch milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub value: T,
    pub last_modified: i64,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, key: &StorageKey) -> Result<Option<Stored<Bytes>>, StoreError>;
    /// Replace the whole object and bump its `last_modified`.
    async fn set(&self, key: &StorageKey, value: Bytes) -> Result<(), StoreError>;
    async fn delete(&self, key: &StorageKey) -> Result<(), StoreError>;
    fn name(&self) -> &'static str;
}

pub async fn read_record(
    store: &dyn ArtifactStore,
    key: &StorageKey,
) -> Result<Option<Stored<ArtifactRecord>>, StoreError> {
    let Some(stored) = store.get(key).await? else {
        return Ok(None);
    };
    let value = ArtifactRecord::decode(&stored.value)?;
    Ok(Some(Stored {
        value,
        last_modified: stored.last_modified,
    }))
}

pub async fn write_record(
    store: &dyn ArtifactStore,
    key: &StorageKey,
    record: &ArtifactRecord,
) -> Result<(), StoreError> {
    store.set(key, record.encode()?).await
}

/// In-process store bounded by LRU eviction.
pub struct MemoryArtifactStore {
    objects: RwLock<LruCache<StorageKey, Stored<Bytes>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryArtifactStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            objects: RwLock::new(LruCache::new(config.store_capacity_non_zero())),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Insert with an explicit write time.
    pub fn insert_at(&self, key: StorageKey, value: Bytes, last_modified: i64) {
        let evicted = rw_write(&self.objects, SOURCE, "insert")
            .push(
                key,
                Stored {
                    value,
                    last_modified,
                },
            )
            .map(|(evicted, _)| evicted);
        if let Some(evicted) = evicted {
            debug!(key = %evicted, "Evicted artifact");
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.objects, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `get` calls served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get(&self, key: &StorageKey) -> Result<Option<Stored<Bytes>>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(rw_write(&self.objects, SOURCE, "get").get(key).cloned())
    }

    async fn set(&self, key: &StorageKey, value: Bytes) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.insert_at(key.clone(), value, now_millis());
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StoreError> {
        rw_write(&self.objects, SOURCE, "delete").pop(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
