use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use super::keys::StorageKey;
use super::store::{ArtifactStore, StoreError, Stored};
use crate::util::clock::system_time_millis;

/// One file per key under a root directory; `last_modified` is the file mtime.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &StorageKey) -> Result<PathBuf, StoreError> {
        let relative = PathBuf::from(key.object_path());
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(StoreError::InvalidKey(key.object_path()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn get(&self, key: &StorageKey) -> Result<Option<Stored<Bytes>>, StoreError> {
        let path = self.path_for(key)?;
        let value = match fs::read(&path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(key, err)),
        };
        let modified = fs::metadata(&path)
            .await
            .and_then(|meta| meta.modified())
            .map_err(|err| StoreError::io(key, err))?;

        Ok(Some(Stored {
            value,
            last_modified: system_time_millis(modified),
        }))
    }

    async fn set(&self, key: &StorageKey, value: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::io(key, err))?;
        }

        // Readers never observe a partially written file.
        let staging = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&staging, &value)
            .await
            .map_err(|err| StoreError::io(key, err))?;
        if let Err(err) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(StoreError::io(key, err));
        }

        debug!(key = %key, bytes = value.len(), "Artifact written");
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(key, err)),
        }
    }

    fn name(&self) -> &'static str {
        "fs"
    }
}
