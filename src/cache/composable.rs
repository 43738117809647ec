//! Cache for sub-page render fragments.
//!
//! `set` publishes the in-flight write before it resolves, so a concurrent
//! `get` for the same key in this process awaits that write instead of
//! reading an older stored entry. Other processes may still regenerate the
//! same key; the last write wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::keys::{Namespace, StorageKey};
use super::lock::mutex_lock;
use super::store::{ArtifactStore, StoreError};
use super::tag_index::{TagIndex, TagIndexError};
use crate::util::clock::now_millis;

const SOURCE: &str = "cache::composable";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposableEntry {
    #[serde(with = "super::record::base64_bytes")]
    pub value: Bytes,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation time in epoch milliseconds.
    pub timestamp: i64,
    pub expire: u64,
    pub stale: u64,
    pub revalidate: u64,
}

type PendingWrite = Shared<BoxFuture<'static, Option<ComposableEntry>>>;

pub struct ComposableCache {
    build_id: String,
    store: Arc<dyn ArtifactStore>,
    tags: Arc<dyn TagIndex>,
    pending: Mutex<HashMap<String, PendingWrite>>,
}

impl ComposableCache {
    pub fn new(
        build_id: impl Into<String>,
        store: Arc<dyn ArtifactStore>,
        tags: Arc<dyn TagIndex>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            store,
            tags,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, key: &str) -> StorageKey {
        StorageKey::new(Namespace::Composable, &self.build_id, key)
    }

    /// Number of writes still in flight.
    pub fn pending_len(&self) -> usize {
        mutex_lock(&self.pending, SOURCE, "pending_len").len()
    }

    /// The in-flight write for `key` if any, else the stored entry unless one
    /// of its tags was revalidated after it was written.
    pub async fn get(&self, key: &str) -> Option<ComposableEntry> {
        let in_flight = mutex_lock(&self.pending, SOURCE, "get").get(key).cloned();
        if let Some(write) = in_flight {
            debug!(key, "Composable entry served from pending write");
            return write.await;
        }

        let storage_key = self.key(key);
        let stored = match self.store.get(&storage_key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %storage_key, error = %err, "Composable read failed");
                return None;
            }
        };
        let entry: ComposableEntry = match serde_json::from_slice(&stored.value) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %storage_key, error = %err, "Malformed composable entry");
                return None;
            }
        };

        match self
            .tags
            .is_revalidated(key, &entry.tags, stored.last_modified)
            .await
        {
            Ok(false) => Some(entry),
            Ok(true) => {
                debug!(key, "Composable entry invalidated by tag");
                None
            }
            Err(err) => {
                warn!(key, error = %err, "Composable tag lookup failed");
                None
            }
        }
    }

    /// Register `pending` before returning, then persist it once the returned
    /// future is driven and `pending` resolves.
    ///
    /// A `get` for `key` issued after this call sees the pending write even if
    /// the returned future has not been polled yet. A `None` result drops the
    /// write.
    pub fn set<'a, F>(
        &'a self,
        key: &str,
        pending: F,
    ) -> impl Future<Output = ()> + Send + use<'a, F>
    where
        F: Future<Output = Option<ComposableEntry>> + Send + 'static,
    {
        let write: PendingWrite = pending.boxed().shared();
        mutex_lock(&self.pending, SOURCE, "set").insert(key.to_string(), write.clone());
        let key = key.to_string();

        async move {
            let resolved = write.clone().await;
            {
                let mut pending = mutex_lock(&self.pending, SOURCE, "set");
                // A newer write for the same key may have replaced ours.
                if pending.get(&key).is_some_and(|current| current.ptr_eq(&write)) {
                    pending.remove(&key);
                }
            }

            let Some(entry) = resolved else {
                debug!(key, "Composable write produced nothing");
                return;
            };
            if let Err(err) = self.persist(&key, &entry).await {
                warn!(key, error = %err, "Composable write failed");
            }
        }
    }

    async fn persist(&self, key: &str, entry: &ComposableEntry) -> Result<(), PersistError> {
        let payload = serde_json::to_vec(entry).map_err(PersistError::Encode)?;
        self.store
            .set(&self.key(key), Bytes::from(payload))
            .await
            .map_err(PersistError::Store)?;
        if !entry.tags.is_empty() {
            self.tags.associate(key, &entry.tags).await?;
        }
        Ok(())
    }

    pub async fn expire_tags(&self, tags: &[String]) -> Result<(), TagIndexError> {
        self.tags.expire_tags(tags).await
    }

    pub async fn get_expiration(&self, tags: &[String]) -> Result<i64, TagIndexError> {
        self.tags.expiration(tags).await
    }

    /// Tags are read through on every `get`; nothing to refresh.
    pub async fn refresh_tags(&self) {}
}

impl ComposableEntry {
    pub fn new(value: impl Into<Bytes>, tags: Vec<String>, revalidate: u64) -> Self {
        Self {
            value: value.into(),
            tags,
            timestamp: now_millis(),
            expire: u64::MAX,
            stale: 0,
            revalidate,
        }
    }
}

#[derive(Debug, Error)]
enum PersistError {
    #[error("encoding failed: {0}")]
    Encode(serde_json::Error),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Tags(#[from] TagIndexError),
}
