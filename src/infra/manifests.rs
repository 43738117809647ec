//! Loading of the build output consumed at startup.

use std::{
    fs,
    path::{Path, PathBuf},
};

use isrgate_manifest::{
    AppPathRoutesManifest, PagesManifest, PrerenderManifest, RoutesManifest, RuntimeOptions,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

use crate::routing::RoutingError;

pub const BUILD_ID_FILE: &str = "BUILD_ID";
pub const ROUTES_MANIFEST_FILE: &str = "routes-manifest.json";
pub const PRERENDER_MANIFEST_FILE: &str = "prerender-manifest.json";
pub const APP_PATH_ROUTES_MANIFEST_FILE: &str = "app-path-routes-manifest.json";
pub const PAGES_MANIFEST_FILE: &str = "pages-manifest.json";
pub const RUNTIME_OPTIONS_FILE: &str = "runtime-options.json";

/// Startup failures. None of these are retried.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{path}` does not contain a build id")]
    EmptyBuildId { path: PathBuf },
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

#[derive(Debug, Clone, Default)]
pub struct BuildManifests {
    pub build_id: String,
    pub routes: RoutesManifest,
    pub prerender: PrerenderManifest,
    pub app_paths: AppPathRoutesManifest,
    pub pages: PagesManifest,
    pub options: RuntimeOptions,
}

impl BuildManifests {
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let build_id_path = dir.join(BUILD_ID_FILE);
        let build_id = read(&build_id_path)?.trim().to_string();
        if build_id.is_empty() {
            return Err(ManifestError::EmptyBuildId {
                path: build_id_path,
            });
        }

        let manifests = Self {
            build_id,
            routes: required(dir, ROUTES_MANIFEST_FILE)?,
            prerender: required(dir, PRERENDER_MANIFEST_FILE)?,
            app_paths: optional(dir, APP_PATH_ROUTES_MANIFEST_FILE)?,
            pages: optional(dir, PAGES_MANIFEST_FILE)?,
            options: optional(dir, RUNTIME_OPTIONS_FILE)?,
        };

        info!(
            build_id = %manifests.build_id,
            dir = %dir.display(),
            static_routes = manifests.routes.static_routes.len(),
            dynamic_routes = manifests.routes.dynamic_routes.len(),
            prerendered = manifests.prerender.routes.len(),
            "Build manifests loaded"
        );
        Ok(manifests)
    }

    /// One-line description used by `isrgate check`.
    pub fn summary(&self) -> String {
        let rewrites = &self.routes.rewrites;
        format!(
            "build {}: {} static / {} dynamic routes, {} redirects, {} rewrites, {} header rules, {} prerendered paths, {} dynamic prerender routes",
            self.build_id,
            self.routes.static_routes.len(),
            self.routes.dynamic_routes.len(),
            self.routes.redirects.len(),
            rewrites.before_files.len() + rewrites.after_files.len() + rewrites.fallback.len(),
            self.routes.headers.len(),
            self.prerender.routes.len(),
            self.prerender.dynamic_routes.len(),
        )
    }
}

fn read(path: &Path) -> Result<String, ManifestError> {
    fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse<T: DeserializeOwned>(path: &Path, raw: &str) -> Result<T, ManifestError> {
    serde_json::from_str(raw).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn required<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T, ManifestError> {
    let path = dir.join(name);
    let raw = read(&path)?;
    parse(&path, &raw)
}

fn optional<T: DeserializeOwned + Default>(dir: &Path, name: &str) -> Result<T, ManifestError> {
    let path = dir.join(name);
    match fs::read_to_string(&path) {
        Ok(raw) => parse(&path, &raw),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(file = name, "Optional manifest absent");
            Ok(T::default())
        }
        Err(source) => Err(ManifestError::Read { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).expect("write fixture");
    }

    #[test]
    fn loads_required_and_defaults_optional() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), BUILD_ID_FILE, "abc123\n");
        write(dir.path(), ROUTES_MANIFEST_FILE, r#"{ "basePath": "" }"#);
        write(
            dir.path(),
            PRERENDER_MANIFEST_FILE,
            r#"{ "routes": { "/albums": { "initialRevalidateSeconds": 60 } } }"#,
        );
        write(dir.path(), RUNTIME_OPTIONS_FILE, r#"{ "trailingSlash": true }"#);

        let manifests = BuildManifests::load(dir.path()).expect("manifests load");

        assert_eq!(manifests.build_id, "abc123");
        assert!(manifests.options.trailing_slash);
        assert!(manifests.pages.is_empty());
        assert!(manifests.summary().contains("1 prerendered paths"));
    }

    #[test]
    fn missing_routes_manifest_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), BUILD_ID_FILE, "abc123");
        write(dir.path(), PRERENDER_MANIFEST_FILE, "{}");

        let err = BuildManifests::load(dir.path()).expect_err("must fail");
        assert!(matches!(err, ManifestError::Read { .. }));
    }

    #[test]
    fn malformed_json_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), BUILD_ID_FILE, "abc123");
        write(dir.path(), ROUTES_MANIFEST_FILE, "{ not json");
        write(dir.path(), PRERENDER_MANIFEST_FILE, "{}");

        let err = BuildManifests::load(dir.path()).expect_err("must fail");
        assert!(matches!(err, ManifestError::Parse { .. }));
    }

    #[test]
    fn blank_build_id_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), BUILD_ID_FILE, "  \n");
        let err = BuildManifests::load(dir.path()).expect_err("must fail");
        assert!(matches!(err, ManifestError::EmptyBuildId { .. }));
    }
}
