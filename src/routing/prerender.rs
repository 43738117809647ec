use std::collections::BTreeMap;

use isrgate_manifest::{Fallback, PrerenderManifest, Revalidate};
use regex::Regex;
use subtle::ConstantTimeEq;

use super::{RoutingError, path_template::compile_manifest_regex};

#[derive(Debug, Clone)]
struct DynamicPrerender {
    regex: Regex,
    fallback: Fallback,
}

/// Lookup structure over the prerender manifest.
#[derive(Debug, Clone)]
pub struct PrerenderIndex {
    routes: BTreeMap<String, Revalidate>,
    dynamic: Vec<DynamicPrerender>,
    preview_mode_id: String,
}

impl PrerenderIndex {
    pub fn new(manifest: &PrerenderManifest) -> Result<Self, RoutingError> {
        let routes = manifest
            .routes
            .iter()
            .map(|(path, route)| (path.clone(), route.initial_revalidate_seconds))
            .collect();

        let dynamic = manifest
            .dynamic_routes
            .values()
            .map(|route| {
                let regex = compile_manifest_regex(&route.route_regex)
                    .map_err(|e| RoutingError::regex(&route.route_regex, e))?;
                Ok(DynamicPrerender {
                    regex,
                    fallback: route.fallback.clone(),
                })
            })
            .collect::<Result<Vec<_>, RoutingError>>()?;

        Ok(Self {
            routes,
            dynamic,
            preview_mode_id: manifest.preview.preview_mode_id.clone(),
        })
    }

    /// Whether `path` may have a prerendered artifact in the store.
    pub fn is_isr(&self, path: &str) -> bool {
        self.routes.contains_key(path) || self.dynamic.iter().any(|d| d.regex.is_match(path))
    }

    pub fn is_pregenerated(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    pub fn initial_revalidate(&self, path: &str) -> Option<Revalidate> {
        self.routes.get(path).copied()
    }

    /// Whether `path` belongs to a dynamic route that 404s for unknown params.
    pub fn fallback_false_matches(&self, path: &str) -> bool {
        self.dynamic
            .iter()
            .filter(|d| d.fallback == Fallback::NotFound)
            .any(|d| d.regex.is_match(path))
    }

    pub fn preview_mode_id(&self) -> &str {
        &self.preview_mode_id
    }

    /// Constant-time check of a presented preview credential. An empty
    /// configured id accepts nothing.
    pub fn accepts_preview_credential(&self, presented: &[u8]) -> bool {
        !self.preview_mode_id.is_empty()
            && presented.ct_eq(self.preview_mode_id.as_bytes()).unwrap_u8() == 1
    }
}
