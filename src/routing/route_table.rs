use std::collections::HashSet;

use isrgate_manifest::{AppPathRoutesManifest, PagesManifest, RouteDefinition, RoutesManifest};
use regex::Regex;

use super::{RoutingError, path_template::compile_manifest_regex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    Page,
    App,
    Route,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub route: String,
    pub kind: RouteType,
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    page: String,
    /// Accepts optional base path and locale prefixes.
    prefixed: Regex,
    /// The manifest regex as written.
    raw: Regex,
}

/// Static and dynamic route matchers compiled once from the routes manifest.
#[derive(Debug, Clone)]
pub struct RouteTable {
    static_routes: Vec<CompiledRoute>,
    dynamic_routes: Vec<CompiledRoute>,
    app_pages: HashSet<String>,
    app_routes: HashSet<String>,
}

impl RouteTable {
    pub fn new(
        routes: &RoutesManifest,
        app_paths: &AppPathRoutesManifest,
        pages: &PagesManifest,
    ) -> Result<Self, RoutingError> {
        let prefix = optional_prefix(&routes.base_path, routes.locales());

        let mut static_definitions = routes.static_routes.clone();
        static_definitions.extend(static_api_routes(routes, app_paths, pages));

        let static_routes = compile_all(&static_definitions, &prefix)?;
        let dynamic_routes = compile_all(&routes.dynamic_routes, &prefix)?;

        let mut app_pages = HashSet::new();
        let mut app_routes = HashSet::new();
        for (app_path, route) in app_paths {
            if app_path.ends_with("page") {
                app_pages.insert(route.clone());
            } else if app_path.ends_with("route") {
                app_routes.insert(route.clone());
            }
        }

        Ok(Self {
            static_routes,
            dynamic_routes,
            app_pages,
            app_routes,
        })
    }

    /// Static routes matching a possibly base-path or locale prefixed path.
    pub fn match_static(&self, path: &str) -> Vec<MatchResult> {
        self.collect(&self.static_routes, path)
    }

    pub fn match_dynamic(&self, path: &str) -> Vec<MatchResult> {
        self.collect(&self.dynamic_routes, path)
    }

    /// The route serving `path`. A static match shadows any dynamic one.
    pub fn resolve(&self, path: &str) -> Option<MatchResult> {
        self.match_static(path)
            .into_iter()
            .next()
            .or_else(|| self.match_dynamic(path).into_iter().next())
    }

    /// Whether a static route's unprefixed regex matches `path`.
    ///
    /// The rewrite phases gate on this and [`Self::is_dynamic`]: they test the
    /// manifest regexes as written, so a locale-prefixed path is not static.
    pub fn is_static(&self, path: &str) -> bool {
        self.static_routes.iter().any(|r| r.raw.is_match(path))
    }

    pub fn is_dynamic(&self, path: &str) -> bool {
        self.dynamic_routes.iter().any(|r| r.raw.is_match(path))
    }

    fn collect(&self, routes: &[CompiledRoute], path: &str) -> Vec<MatchResult> {
        routes
            .iter()
            .filter(|r| r.prefixed.is_match(path))
            .map(|r| MatchResult {
                route: r.page.clone(),
                kind: self.route_type(&r.page),
            })
            .collect()
    }

    fn route_type(&self, page: &str) -> RouteType {
        if self.app_pages.contains(page) {
            RouteType::App
        } else if self.app_routes.contains(page) {
            RouteType::Route
        } else {
            RouteType::Page
        }
    }
}

fn optional_prefix(base_path: &str, locales: &[String]) -> String {
    let locale_alternatives = locales
        .iter()
        .map(|locale| format!("{}/?", regex::escape(locale)))
        .collect::<Vec<_>>()
        .join("|");
    let base = if base_path.is_empty() {
        "^/".to_string()
    } else {
        format!("^{}/?", regex::escape(base_path))
    };
    format!("{base}(?:{locale_alternatives})?")
}

fn compile_all(
    definitions: &[RouteDefinition],
    prefix: &str,
) -> Result<Vec<CompiledRoute>, RoutingError> {
    definitions
        .iter()
        .map(|definition| {
            let raw = compile_manifest_regex(&definition.regex)
                .map_err(|e| RoutingError::regex(&definition.regex, e))?;
            let prefixed_source = raw.as_str().replacen("^/", prefix, 1);
            let prefixed =
                Regex::new(&prefixed_source).map_err(|e| RoutingError::regex(&prefixed_source, e))?;
            Ok(CompiledRoute {
                page: definition.page.clone(),
                prefixed,
                raw,
            })
        })
        .collect()
}

/// API routes are omitted from the manifest's static list; synthesize them
/// unless a dynamic route owns the same page.
fn static_api_routes(
    routes: &RoutesManifest,
    app_paths: &AppPathRoutesManifest,
    pages: &PagesManifest,
) -> Vec<RouteDefinition> {
    let dynamic_pages: HashSet<&str> = routes
        .dynamic_routes
        .iter()
        .map(|r| r.page.as_str())
        .collect();

    let from_pages = pages
        .keys()
        .filter(|page| page.starts_with("/api/") && !dynamic_pages.contains(page.as_str()));
    let from_app = app_paths.values().filter(|route| {
        (route.starts_with("/api/") || route.as_str() == "/api")
            && !dynamic_pages.contains(route.as_str())
    });

    from_pages
        .chain(from_app)
        .map(|route| RouteDefinition {
            page: route.clone(),
            regex: format!("^{}(?:/)?$", regex::escape(route)),
        })
        .collect()
}
