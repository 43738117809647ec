//! Write-back side of the artifact cache, used by the render pipeline.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use super::keys::{Namespace, StorageKey};
use super::record::ArtifactRecord;
use super::store::{ArtifactStore, StoreError, Stored, read_record, write_record};
use super::tag_index::{TagIndex, TagIndexError};

#[derive(Debug, Error)]
pub enum IncrementalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tags(#[from] TagIndexError),
}

/// Full-page and fetch artifacts for one build, plus their tag associations.
pub struct IncrementalCache {
    build_id: String,
    store: Arc<dyn ArtifactStore>,
    tags: Arc<dyn TagIndex>,
}

impl IncrementalCache {
    pub fn new(
        build_id: impl Into<String>,
        store: Arc<dyn ArtifactStore>,
        tags: Arc<dyn TagIndex>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            store,
            tags,
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn tag_index(&self) -> &dyn TagIndex {
        self.tags.as_ref()
    }

    fn key(&self, namespace: Namespace, key: &str) -> StorageKey {
        StorageKey::new(namespace, &self.build_id, key)
    }

    pub async fn get(
        &self,
        key: &str,
        namespace: Namespace,
    ) -> Result<Option<Stored<ArtifactRecord>>, StoreError> {
        read_record(self.store.as_ref(), &self.key(namespace, key)).await
    }

    /// Persist `record`, then link its tags to `key`.
    ///
    /// Fetch records go to the fetch namespace; everything else to the page cache.
    #[instrument(skip(self, record), fields(kind = record.kind()))]
    pub async fn set(&self, key: &str, record: &ArtifactRecord) -> Result<(), IncrementalError> {
        let namespace = match record {
            ArtifactRecord::Fetch { .. } => Namespace::Fetch,
            _ => Namespace::Cache,
        };
        write_record(self.store.as_ref(), &self.key(namespace, key), record).await?;

        let tags = record.tags();
        if !tags.is_empty() {
            self.tags.associate(key, &tags).await?;
        }
        debug!(key, tags = tags.len(), store = self.store.name(), "Artifact stored");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(&self.key(Namespace::Cache, key)).await
    }

    /// Invalidate every artifact carrying any of `tags`.
    #[instrument(skip(self))]
    pub async fn revalidate_tags(&self, tags: &[String]) -> Result<(), TagIndexError> {
        if tags.is_empty() {
            return Ok(());
        }
        self.tags.expire_tags(tags).await
    }
}
