//! In-process tag stores backing the two [`TagIndex`](super::tag_index::TagIndex) strategies.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;

use super::lock::{rw_read, rw_write};
use super::tag_index::{PathTagStore, REVALIDATED, TagIndexError, TagRecord, TagTimestampStore};
use crate::util::clock::now_millis;

const SOURCE: &str = "cache::tag_store";

/// Tag ↔ path registry with a revalidation time per pair.
#[derive(Default)]
pub struct MemoryPathTagStore {
    /// tag → path → revalidated_at
    by_tag: RwLock<HashMap<String, BTreeMap<String, i64>>>,
    /// path → tags
    by_path: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl MemoryPathTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag_count(&self) -> usize {
        rw_read(&self.by_tag, SOURCE, "tag_count").len()
    }
}

#[async_trait]
impl PathTagStore for MemoryPathTagStore {
    async fn get_by_tag(&self, tag: &str) -> Result<Vec<String>, TagIndexError> {
        Ok(rw_read(&self.by_tag, SOURCE, "get_by_tag")
            .get(tag)
            .map(|paths| paths.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_by_path(&self, path: &str) -> Result<Vec<String>, TagIndexError> {
        Ok(rw_read(&self.by_path, SOURCE, "get_by_path")
            .get(path)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_last_modified(
        &self,
        path: &str,
        last_modified: i64,
    ) -> Result<i64, TagIndexError> {
        let tags: Vec<String> = rw_read(&self.by_path, SOURCE, "get_last_modified")
            .get(path)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default();
        if tags.is_empty() {
            return Ok(last_modified);
        }

        let by_tag = rw_read(&self.by_tag, SOURCE, "get_last_modified");
        let revalidated = tags.iter().any(|tag| {
            by_tag
                .get(tag)
                .and_then(|paths| paths.get(path))
                .is_some_and(|at| *at > last_modified)
        });
        Ok(if revalidated { REVALIDATED } else { last_modified })
    }

    async fn write_tags(&self, records: Vec<TagRecord>) -> Result<(), TagIndexError> {
        let now = now_millis();
        // Lock order: by_tag then by_path.
        let mut by_tag = rw_write(&self.by_tag, SOURCE, "write_tags");
        let mut by_path = rw_write(&self.by_path, SOURCE, "write_tags");
        for record in records {
            let at = record.revalidated_at.unwrap_or(now);
            by_tag
                .entry(record.tag.clone())
                .or_default()
                .insert(record.path.clone(), at);
            by_path.entry(record.path).or_default().insert(record.tag);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory-path"
    }
}

/// Tag → last revalidation time.
#[derive(Default)]
pub struct MemoryTagTimestampStore {
    revalidated: DashMap<String, i64>,
}

impl MemoryTagTimestampStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an explicit revalidation time for `tag`.
    pub fn mark_at(&self, tag: impl Into<String>, at: i64) {
        self.revalidated.insert(tag.into(), at);
    }
}

#[async_trait]
impl TagTimestampStore for MemoryTagTimestampStore {
    async fn has_been_revalidated(
        &self,
        tags: &[String],
        since: i64,
    ) -> Result<bool, TagIndexError> {
        Ok(tags.iter().any(|tag| {
            self.revalidated
                .get(tag)
                .is_some_and(|at| *at.value() > since)
        }))
    }

    async fn get_last_revalidated(&self, tags: &[String]) -> Result<i64, TagIndexError> {
        Ok(tags
            .iter()
            .filter_map(|tag| self.revalidated.get(tag).map(|at| *at.value()))
            .max()
            .unwrap_or(0))
    }

    async fn write_tags(&self, tags: &[String]) -> Result<(), TagIndexError> {
        let now = now_millis();
        for tag in tags {
            self.revalidated.insert(tag.clone(), now);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory-timestamp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: &str, path: &str, at: Option<i64>) -> TagRecord {
        TagRecord {
            tag: tag.into(),
            path: path.into(),
            revalidated_at: at,
        }
    }

    #[tokio::test]
    async fn registry_is_bidirectional() {
        let store = MemoryPathTagStore::new();
        store
            .write_tags(vec![
                record("albums", "/albums", Some(1)),
                record("albums", "/albums/1", Some(1)),
                record("music", "/albums", Some(1)),
            ])
            .await
            .expect("write");

        assert_eq!(
            store.get_by_tag("albums").await.expect("by tag"),
            vec!["/albums", "/albums/1"]
        );
        assert_eq!(
            store.get_by_path("/albums").await.expect("by path"),
            vec!["albums", "music"]
        );
        assert_eq!(store.tag_count(), 2);
    }

    #[tokio::test]
    async fn revalidation_after_write_time_returns_sentinel() {
        let store = MemoryPathTagStore::new();
        store
            .write_tags(vec![record("t", "/p", Some(500))])
            .await
            .expect("write");

        assert_eq!(store.get_last_modified("/p", 400).await.expect("lm"), REVALIDATED);
        // Strictly newer only.
        assert_eq!(store.get_last_modified("/p", 500).await.expect("lm"), 500);
        assert_eq!(store.get_last_modified("/other", 400).await.expect("lm"), 400);
    }

    #[tokio::test]
    async fn write_replaces_pair_and_defaults_to_now() {
        let store = MemoryPathTagStore::new();
        store
            .write_tags(vec![record("t", "/p", Some(1))])
            .await
            .expect("write");
        let before = now_millis() - 1;
        store
            .write_tags(vec![record("t", "/p", None)])
            .await
            .expect("write");

        assert_eq!(store.get_by_tag("t").await.expect("by tag").len(), 1);
        assert_eq!(store.get_last_modified("/p", before).await.expect("lm"), REVALIDATED);
    }

    #[tokio::test]
    async fn timestamps_report_latest_and_compare_strictly() {
        let store = MemoryTagTimestampStore::new();
        store.mark_at("a", 100);
        store.mark_at("b", 300);
        let tags = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        assert_eq!(store.get_last_revalidated(&tags).await.expect("last"), 300);
        assert!(store.has_been_revalidated(&tags, 299).await.expect("check"));
        assert!(!store.has_been_revalidated(&tags, 300).await.expect("check"));
        assert_eq!(
            store
                .get_last_revalidated(&["c".to_string()])
                .await
                .expect("last"),
            0
        );
    }
}
