//! Manifest types produced by the build toolchain and consumed by the isrgate runtime.
//!
//! All types deserialize from the camelCase JSON emitted at build time. They are
//! immutable once loaded; the runtime compiles them into matchers at startup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maps an app-router path (`/blog/[slug]/page`) to its public route (`/blog/[slug]`).
pub type AppPathRoutesManifest = BTreeMap<String, String>;

/// Maps a pages-router page (`/api/hello`) to its compiled file.
pub type PagesManifest = BTreeMap<String, String>;

/// Routing section of the build output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutesManifest {
    pub base_path: String,
    pub i18n: Option<I18nConfig>,
    pub static_routes: Vec<RouteDefinition>,
    pub dynamic_routes: Vec<RouteDefinition>,
    pub redirects: Vec<RedirectDefinition>,
    pub rewrites: Rewrites,
    pub headers: Vec<HeaderDefinition>,
}

impl RoutesManifest {
    /// Configured locales, empty when i18n is disabled.
    pub fn locales(&self) -> &[String] {
        self.i18n
            .as_ref()
            .map(|i18n| i18n.locales.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub page: String,
    pub regex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct I18nConfig {
    pub locales: Vec<String>,
    pub default_locale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale_detection: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<DomainLocale>,
}

impl I18nConfig {
    /// Locale detection is on unless explicitly disabled.
    pub fn detection_enabled(&self) -> bool {
        self.locale_detection != Some(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainLocale {
    pub domain: String,
    pub default_locale: String,
    #[serde(default)]
    pub locales: Vec<String>,
}

/// Kind of request attribute a `has`/`missing` condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HasKind {
    Header,
    Cookie,
    Query,
    Host,
}

/// A single `has`/`missing` predicate. `value` is a regular expression; when
/// absent the predicate only checks presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHas {
    #[serde(rename = "type")]
    pub kind: HasKind,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteDefinition {
    pub source: String,
    pub destination: String,
    pub regex: String,
    #[serde(default)]
    pub has: Vec<RouteHas>,
    #[serde(default)]
    pub missing: Vec<RouteHas>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectDefinition {
    #[serde(flatten)]
    pub rule: RewriteDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub internal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderDefinition {
    pub source: String,
    pub regex: String,
    pub headers: Vec<HeaderPair>,
    #[serde(default)]
    pub has: Vec<RouteHas>,
    #[serde(default)]
    pub missing: Vec<RouteHas>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<bool>,
}

/// Rewrite phases. A bare array in the manifest is treated as `afterFiles`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RewritesRepr")]
pub struct Rewrites {
    pub before_files: Vec<RewriteDefinition>,
    pub after_files: Vec<RewriteDefinition>,
    pub fallback: Vec<RewriteDefinition>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RewritesRepr {
    Flat(Vec<RewriteDefinition>),
    #[serde(rename_all = "camelCase")]
    Phased {
        #[serde(default)]
        before_files: Vec<RewriteDefinition>,
        #[serde(default)]
        after_files: Vec<RewriteDefinition>,
        #[serde(default)]
        fallback: Vec<RewriteDefinition>,
    },
}

impl From<RewritesRepr> for Rewrites {
    fn from(repr: RewritesRepr) -> Self {
        match repr {
            RewritesRepr::Flat(after_files) => Self {
                after_files,
                ..Self::default()
            },
            RewritesRepr::Phased {
                before_files,
                after_files,
                fallback,
            } => Self {
                before_files,
                after_files,
                fallback,
            },
        }
    }
}

/// Prerender section of the build output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrerenderManifest {
    pub routes: BTreeMap<String, PrerenderRoute>,
    pub dynamic_routes: BTreeMap<String, DynamicPrerenderRoute>,
    pub preview: PreviewProps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerenderRoute {
    pub initial_revalidate_seconds: Revalidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_route: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPrerenderRoute {
    pub route_regex: String,
    #[serde(default)]
    pub fallback: Fallback,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_route: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewProps {
    #[serde(default)]
    pub preview_mode_id: String,
}

/// Revalidation policy: a number of seconds, or `false` for never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RevalidateRepr", into = "RevalidateRepr")]
pub enum Revalidate {
    After(u64),
    Never,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RevalidateRepr {
    Seconds(u64),
    Flag(bool),
}

impl TryFrom<RevalidateRepr> for Revalidate {
    type Error = String;

    fn try_from(repr: RevalidateRepr) -> Result<Self, Self::Error> {
        match repr {
            RevalidateRepr::Seconds(seconds) => Ok(Self::After(seconds)),
            RevalidateRepr::Flag(false) => Ok(Self::Never),
            RevalidateRepr::Flag(true) => Err("revalidate must be a number or `false`".to_string()),
        }
    }
}

impl From<Revalidate> for RevalidateRepr {
    fn from(value: Revalidate) -> Self {
        match value {
            Revalidate::After(seconds) => Self::Seconds(seconds),
            Revalidate::Never => Self::Flag(false),
        }
    }
}

/// Fallback behaviour of a dynamic prerendered route.
///
/// `false` in the manifest means unknown paths are not found; `null` means
/// blocking render; a string names the fallback page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<FallbackRepr>", into = "Option<FallbackRepr>")]
pub enum Fallback {
    Page(String),
    #[default]
    Blocking,
    NotFound,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum FallbackRepr {
    Page(String),
    Flag(bool),
}

impl From<Option<FallbackRepr>> for Fallback {
    fn from(repr: Option<FallbackRepr>) -> Self {
        match repr {
            None | Some(FallbackRepr::Flag(true)) => Self::Blocking,
            Some(FallbackRepr::Flag(false)) => Self::NotFound,
            Some(FallbackRepr::Page(page)) => Self::Page(page),
        }
    }
}

impl From<Fallback> for Option<FallbackRepr> {
    fn from(value: Fallback) -> Self {
        match value {
            Fallback::Page(page) => Some(FallbackRepr::Page(page)),
            Fallback::Blocking => None,
            Fallback::NotFound => Some(FallbackRepr::Flag(false)),
        }
    }
}

/// Framework options that affect routing but are not part of the routes manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeOptions {
    pub trailing_slash: bool,
    pub skip_trailing_slash_redirect: bool,
}
