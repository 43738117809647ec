//! Cache configuration.
//!
//! Derived from the `[cache]` and `[revalidation]` settings sections.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::Deserialize;

const DEFAULT_STORE_CAPACITY: usize = 1024;
const DEFAULT_FS_ROOT: &str = "cache";
const DEFAULT_MAX_REVALIDATE_CONCURRENCY: u32 = 10;
const DEFAULT_QUEUE_LIMIT: usize = 10_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 1000;

/// Where artifacts are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Fs,
}

/// Tag invalidation strategy, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TagMode {
    /// Path-oriented index; invalidation computed by the reader.
    #[default]
    Original,
    /// Tag timestamps; invalidation computed by the store.
    NextMode,
}

impl TagMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::NextMode => "nextMode",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: StoreBackend,
    /// Root directory of the fs backend.
    pub fs_root: PathBuf,
    /// Maximum artifacts held by the memory backend.
    pub store_capacity: usize,
    pub tag_mode: TagMode,
    /// Number of revalidation partitions.
    pub max_revalidate_concurrency: u32,
    /// Maximum pending revalidation messages.
    pub queue_limit: usize,
    /// Maximum messages per consumer batch.
    pub consume_batch_limit: usize,
    /// Consumer interval (ms); zero disables the background consumer.
    pub auto_consume_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            fs_root: PathBuf::from(DEFAULT_FS_ROOT),
            store_capacity: DEFAULT_STORE_CAPACITY,
            tag_mode: TagMode::default(),
            max_revalidate_concurrency: DEFAULT_MAX_REVALIDATE_CONCURRENCY,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
        }
    }
}

impl CacheConfig {
    pub fn from_settings(
        cache: &crate::config::CacheSettings,
        revalidation: &crate::config::RevalidationSettings,
    ) -> Self {
        Self {
            backend: cache.backend,
            fs_root: cache.fs_root.clone(),
            store_capacity: cache.store_capacity,
            tag_mode: cache.tag_mode,
            max_revalidate_concurrency: revalidation.max_concurrency,
            queue_limit: revalidation.queue_limit,
            consume_batch_limit: revalidation.consume_batch_limit,
            auto_consume_interval_ms: revalidation.auto_consume_interval_ms,
        }
    }

    /// Store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn store_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.store_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Partition count, clamped to at least one.
    pub fn max_revalidate_concurrency(&self) -> u32 {
        self.max_revalidate_concurrency.max(1)
    }
}
