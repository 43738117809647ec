//! Tag-based invalidation.
//!
//! Two storage contracts exist, one per [`TagMode`]. Callers only see the
//! [`TagIndex`] strategy chosen at startup and never branch on the mode.
//!
//! Invariant: once a tag is revalidated at time `T`, any artifact written
//! before `T` that carries the tag reads as invalidated.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::config::TagMode;
use crate::util::clock::now_millis;

/// Timestamp written when a tag is merely linked to a path. It predates any
/// real write, so association alone never invalidates an artifact.
pub const ASSOCIATION_TIMESTAMP: i64 = 1;

/// Sentinel returned by [`PathTagStore::get_last_modified`] when a tag of the
/// path was revalidated after the known write time.
pub const REVALIDATED: i64 = -1;

#[derive(Debug, Error)]
pub enum TagIndexError {
    #[error("tag store `{store}` failed: {message}")]
    Backend {
        store: &'static str,
        message: String,
    },
}

impl TagIndexError {
    pub fn backend(store: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            store,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagRecord {
    pub tag: String,
    pub path: String,
    /// `None` lets the store stamp the current time.
    pub revalidated_at: Option<i64>,
}

/// Path-oriented storage used by [`TagMode::Original`].
#[async_trait]
pub trait PathTagStore: Send + Sync {
    async fn get_by_tag(&self, tag: &str) -> Result<Vec<String>, TagIndexError>;
    async fn get_by_path(&self, path: &str) -> Result<Vec<String>, TagIndexError>;
    /// `REVALIDATED` if any tag of `path` was revalidated strictly after
    /// `last_modified`, otherwise `last_modified`.
    async fn get_last_modified(&self, path: &str, last_modified: i64)
    -> Result<i64, TagIndexError>;
    /// Replace the given `(tag, path)` pairs.
    async fn write_tags(&self, records: Vec<TagRecord>) -> Result<(), TagIndexError>;
    fn name(&self) -> &'static str;
}

/// Tag-timestamp storage used by [`TagMode::NextMode`].
#[async_trait]
pub trait TagTimestampStore: Send + Sync {
    /// Whether any of `tags` was revalidated strictly after `since`.
    async fn has_been_revalidated(&self, tags: &[String], since: i64)
    -> Result<bool, TagIndexError>;
    /// Latest revalidation time across `tags`, `0` when none.
    async fn get_last_revalidated(&self, tags: &[String]) -> Result<i64, TagIndexError>;
    /// Mark `tags` revalidated now.
    async fn write_tags(&self, tags: &[String]) -> Result<(), TagIndexError>;
    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait TagIndex: Send + Sync {
    fn mode(&self) -> TagMode;

    /// Whether the artifact at `path` carrying `tags`, written at
    /// `last_modified`, has been invalidated by a tag.
    async fn is_revalidated(
        &self,
        path: &str,
        tags: &[String],
        last_modified: i64,
    ) -> Result<bool, TagIndexError>;

    /// Record that `path` carries `tags`.
    async fn associate(&self, path: &str, tags: &[String]) -> Result<(), TagIndexError>;

    /// Invalidate every artifact carrying any of `tags`.
    async fn expire_tags(&self, tags: &[String]) -> Result<(), TagIndexError>;

    /// Latest expiration time across `tags`; `0` when the mode cannot tell.
    async fn expiration(&self, tags: &[String]) -> Result<i64, TagIndexError>;
}

pub struct OriginalTagIndex {
    store: Arc<dyn PathTagStore>,
}

impl OriginalTagIndex {
    pub fn new(store: Arc<dyn PathTagStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TagIndex for OriginalTagIndex {
    fn mode(&self) -> TagMode {
        TagMode::Original
    }

    async fn is_revalidated(
        &self,
        path: &str,
        _tags: &[String],
        last_modified: i64,
    ) -> Result<bool, TagIndexError> {
        let seen = self.store.get_last_modified(path, last_modified).await?;
        Ok(seen == REVALIDATED)
    }

    /// Writes only the tags not yet recorded for `path`.
    async fn associate(&self, path: &str, tags: &[String]) -> Result<(), TagIndexError> {
        if tags.is_empty() {
            return Ok(());
        }
        let known: BTreeSet<String> = self.store.get_by_path(path).await?.into_iter().collect();
        let records: Vec<TagRecord> = tags
            .iter()
            .filter(|tag| !known.contains(*tag))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|tag| TagRecord {
                tag: tag.clone(),
                path: path.to_string(),
                revalidated_at: Some(ASSOCIATION_TIMESTAMP),
            })
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        debug!(path, count = records.len(), "Associating new tags");
        self.store.write_tags(records).await
    }

    async fn expire_tags(&self, tags: &[String]) -> Result<(), TagIndexError> {
        let now = now_millis();
        let mut records = BTreeSet::new();
        for tag in tags {
            for path in self.store.get_by_tag(tag).await? {
                records.insert(TagRecord {
                    tag: tag.clone(),
                    path,
                    revalidated_at: Some(now),
                });
            }
        }
        if records.is_empty() {
            return Ok(());
        }
        debug!(tags = ?tags, paths = records.len(), "Expiring tagged paths");
        self.store.write_tags(records.into_iter().collect()).await
    }

    async fn expiration(&self, _tags: &[String]) -> Result<i64, TagIndexError> {
        Ok(0)
    }
}

pub struct NextModeTagIndex {
    store: Arc<dyn TagTimestampStore>,
}

impl NextModeTagIndex {
    pub fn new(store: Arc<dyn TagTimestampStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TagIndex for NextModeTagIndex {
    fn mode(&self) -> TagMode {
        TagMode::NextMode
    }

    async fn is_revalidated(
        &self,
        _path: &str,
        tags: &[String],
        last_modified: i64,
    ) -> Result<bool, TagIndexError> {
        if tags.is_empty() {
            return Ok(false);
        }
        self.store.has_been_revalidated(tags, last_modified).await
    }

    async fn associate(&self, _path: &str, _tags: &[String]) -> Result<(), TagIndexError> {
        Ok(())
    }

    async fn expire_tags(&self, tags: &[String]) -> Result<(), TagIndexError> {
        if tags.is_empty() {
            return Ok(());
        }
        self.store.write_tags(tags).await
    }

    async fn expiration(&self, tags: &[String]) -> Result<i64, TagIndexError> {
        self.store.get_last_revalidated(tags).await
    }
}
