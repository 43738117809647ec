//! Cache key derivation.
//!
//! A key is a pure function of `(build_id, path, variant)`. Locale and
//! data-route decoration is removed before the path reaches this module.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::routing::{InternalRequest, matcher::NEXT_DATA_QUERY};

/// Representation requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Html,
    Json,
    Rsc,
}

impl Variant {
    /// Selected by request shape only: data route, then `rsc` header, then html.
    pub fn detect(request: &InternalRequest) -> Self {
        if request.query.contains(NEXT_DATA_QUERY) {
            Self::Json
        } else if request.header("rsc").is_some_and(|v| !v.is_empty()) {
            Self::Rsc
        } else {
            Self::Html
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Html => "text/html; charset=utf-8",
            Self::Json => "application/json",
            Self::Rsc => "text/x-component",
        }
    }
}

/// Top-level partition of the artifact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Cache,
    Fetch,
    Composable,
}

impl Namespace {
    pub fn dir(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Fetch => "__fetch",
            Self::Composable => "composable",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Fetch => "fetch",
            Self::Composable => "composable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub build_id: String,
    pub path: String,
    pub variant: Variant,
}

impl CacheKey {
    pub fn new(build_id: impl Into<String>, path: impl Into<String>, variant: Variant) -> Self {
        Self {
            build_id: build_id.into(),
            path: path.into(),
            variant,
        }
    }

    /// All variants of a path live in one stored record.
    pub fn storage_key(&self) -> StorageKey {
        StorageKey::new(Namespace::Cache, &self.build_id, &self.path)
    }
}

/// Address of one object in an [`ArtifactStore`](super::store::ArtifactStore).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub namespace: Namespace,
    pub build_id: String,
    pub path: String,
}

impl StorageKey {
    pub fn new(namespace: Namespace, build_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            namespace,
            build_id: build_id.into(),
            path: path.into(),
        }
    }

    /// Relative object path: `<namespace>/<build_id>/<path>.<ext>`.
    pub fn object_path(&self) -> String {
        format!(
            "{}/{}/{}.{}",
            self.namespace.dir(),
            self.build_id,
            self.path.trim_start_matches('/'),
            self.namespace.extension()
        )
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_path())
    }
}

/// Strip the base path and trailing slash from a localized path; the root maps to `index`.
pub fn normalize_cache_path(localized: &str, base_path: &str) -> String {
    let path = if base_path.is_empty() {
        localized
    } else {
        localized.strip_prefix(base_path).unwrap_or(localized)
    };
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.is_empty() {
        "index".to_string()
    } else {
        path.to_string()
    }
}

/// Hex SHA-256 of `bytes`, used for etags and deduplication ids.
pub fn content_digest(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;

    #[test]
    fn variant_follows_request_shape() {
        let html = InternalRequest::new(Method::GET, "/albums");
        assert_eq!(Variant::detect(&html), Variant::Html);

        let rsc = html.clone().with_header("RSC", "1");
        assert_eq!(Variant::detect(&rsc), Variant::Rsc);

        let data = InternalRequest::new(Method::GET, "/albums?__nextDataReq=1").with_header("rsc", "1");
        assert_eq!(Variant::detect(&data), Variant::Json);
    }

    #[test]
    fn normalization_strips_decoration() {
        assert_eq!(normalize_cache_path("/docs/en/guide/", "/docs"), "/en/guide");
        assert_eq!(normalize_cache_path("/", ""), "index");
        assert_eq!(normalize_cache_path("/docs", "/docs"), "index");
        assert_eq!(normalize_cache_path("/albums", ""), "/albums");
    }

    #[test]
    fn keys_are_pure() {
        let a = CacheKey::new("B1", "/albums", Variant::Html);
        let b = CacheKey::new("B1", "/albums", Variant::Html);
        assert_eq!(a, b);
        assert_eq!(a.storage_key().object_path(), "cache/B1/albums.cache");
        assert_eq!(
            StorageKey::new(Namespace::Fetch, "B1", "abc").object_path(),
            "__fetch/B1/abc.fetch"
        );
    }

    #[test]
    fn digest_is_stable_hex() {
        let digest = content_digest("hello");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, content_digest(b"hello"));
        assert_ne!(digest, content_digest("hello!"));
    }
}
