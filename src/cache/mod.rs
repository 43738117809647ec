//! Incremental artifact cache.
//!
//! - **Read path**: [`CacheInterceptor`] serves stored artifacts with
//!   stale-while-revalidate semantics.
//! - **Write path**: [`IncrementalCache`] persists render output and links tags.
//! - **Fragments**: [`ComposableCache`] caches sub-page units with in-flight
//!   write sharing.
//!
//! Backends are chosen once at startup from the `[cache]` settings:
//!
//! ```toml
//! [cache]
//! backend = "fs"
//! fs_root = "/var/cache/isrgate"
//! tag_mode = "nextMode"
//! ```

pub mod composable;
mod config;
mod fs_store;
pub mod incremental;
pub mod interceptor;
pub mod keys;
pub(crate) mod lock;
pub mod record;
pub mod store;
pub mod tag_index;
pub mod tag_store;

use std::sync::Arc;

use tracing::info;

pub use composable::{ComposableCache, ComposableEntry};
pub use config::{CacheConfig, StoreBackend, TagMode};
pub use fs_store::FsArtifactStore;
pub use incremental::{IncrementalCache, IncrementalError};
pub use interceptor::{CACHE_STATUS_HEADER, CacheInterceptor, CacheState, Interception, MissReason};
pub use keys::{CacheKey, Namespace, StorageKey, Variant};
pub use record::{ArtifactRecord, Meta};
pub use store::{ArtifactStore, MemoryArtifactStore, StoreError, Stored};
pub use tag_index::{NextModeTagIndex, OriginalTagIndex, TagIndex, TagIndexError};
pub use tag_store::{MemoryPathTagStore, MemoryTagTimestampStore};

/// Artifact store for the configured backend.
pub fn artifact_store(config: &CacheConfig) -> Arc<dyn ArtifactStore> {
    let store: Arc<dyn ArtifactStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryArtifactStore::new(config)),
        StoreBackend::Fs => Arc::new(FsArtifactStore::new(&config.fs_root)),
    };
    info!(backend = store.name(), "Artifact store ready");
    store
}

/// Tag index strategy for the configured mode.
pub fn tag_index(mode: TagMode) -> Arc<dyn TagIndex> {
    let index: Arc<dyn TagIndex> = match mode {
        TagMode::Original => Arc::new(OriginalTagIndex::new(Arc::new(MemoryPathTagStore::new()))),
        TagMode::NextMode => Arc::new(NextModeTagIndex::new(Arc::new(
            MemoryTagTimestampStore::new(),
        ))),
    };
    info!(mode = mode.as_str(), "Tag index ready");
    index
}
