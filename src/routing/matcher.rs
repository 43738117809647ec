//! Rewrite, redirect and header rules compiled from the routes manifest, plus
//! the fixed built-in stages (trailing slash, data routes, fallback-false).

use std::borrow::Cow;
use std::ops::ControlFlow;

use isrgate_manifest::{
    HasKind, HeaderDefinition, RedirectDefinition, RewriteDefinition, RouteHas, RuntimeOptions,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{
    RoutingError,
    i18n::LocaleResolver,
    path_template::{Params, PathTemplate, compile_manifest_regex},
    prerender::PrerenderIndex,
    request::{InternalRequest, PreparedResponse, QueryParams, split_url},
};

const DEFAULT_REDIRECT_STATUS: u16 = 308;
pub const NEXT_DATA_QUERY: &str = "__nextDataReq";
const DATA_ROUTE_PREFIX: &str = "/_next/data";

static FILE_LIKE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\w-]+\.[\w]+$").expect("valid file-like regex"));
static EXTERNAL_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://").expect("valid external url regex"));
static EXTERNAL_PARTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?:)//?([^/\s]+)(/[^?]*)?(\?.*)?").expect("valid external parts regex")
});

pub fn is_external(url: &str) -> bool {
    EXTERNAL_URL.is_match(url)
}

#[derive(Debug, Clone)]
struct Predicate {
    kind: HasKind,
    key: String,
    value: Option<Regex>,
    anchored: Option<Regex>,
}

impl Predicate {
    fn new(has: &RouteHas) -> Result<Self, RoutingError> {
        let key = match has.kind {
            HasKind::Header => has.key.to_ascii_lowercase(),
            _ => has.key.clone(),
        };
        let (value, anchored) = match &has.value {
            Some(pattern) => {
                let value = compile_manifest_regex(pattern)
                    .map_err(|e| RoutingError::regex(pattern, e))?;
                let anchored_source = format!("^(?:{})$", value.as_str());
                let anchored = Regex::new(&anchored_source)
                    .map_err(|e| RoutingError::regex(&anchored_source, e))?;
                (Some(value), Some(anchored))
            }
            None => (None, None),
        };
        Ok(Self {
            kind: has.kind,
            key,
            value,
            anchored,
        })
    }

    fn subject<'a>(&self, request: &'a InternalRequest) -> Option<Cow<'a, str>> {
        let raw = match self.kind {
            HasKind::Header => request.header(&self.key).map(Cow::Borrowed),
            HasKind::Cookie => request.cookies.get(&self.key).map(|v| Cow::Borrowed(v.as_str())),
            HasKind::Query => request.query.joined(&self.key).map(Cow::Owned),
            HasKind::Host => Some(Cow::Borrowed(request.host())),
        };
        raw.filter(|value| !value.is_empty() || self.kind == HasKind::Query)
    }

    fn test(&self, value: &str) -> bool {
        self.value.as_ref().is_none_or(|regex| regex.is_match(value))
    }

    fn holds(&self, request: &InternalRequest) -> bool {
        if self.kind == HasKind::Query {
            let values = request.query.get_all(&self.key);
            return !values.is_empty() && values.into_iter().any(|v| self.test(v));
        }
        self.subject(request).is_some_and(|value| self.test(&value))
    }

    /// Named groups captured by the full-value match.
    fn captures(&self, request: &InternalRequest, params: &mut Params) {
        let Some(anchored) = &self.anchored else {
            return;
        };
        let subject = self.subject(request).unwrap_or_default();
        let Some(captures) = anchored.captures(&subject) else {
            return;
        };
        for name in anchored.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                params.insert(name.to_string(), m.as_str().to_string());
            }
        }
    }
}

/// Path regex, source template and `has`/`missing` conditions shared by every rule kind.
#[derive(Debug, Clone)]
struct RuleMatcher {
    regex: Regex,
    source: PathTemplate,
    has: Vec<Predicate>,
    missing: Vec<Predicate>,
    locale_aware: bool,
}

impl RuleMatcher {
    fn new(
        regex: &str,
        source: &str,
        has: &[RouteHas],
        missing: &[RouteHas],
        locale: Option<bool>,
    ) -> Result<Self, RoutingError> {
        Ok(Self {
            regex: compile_manifest_regex(regex).map_err(|e| RoutingError::regex(regex, e))?,
            source: PathTemplate::parse(source)?,
            has: has.iter().map(Predicate::new).collect::<Result<_, _>>()?,
            missing: missing.iter().map(Predicate::new).collect::<Result<_, _>>()?,
            locale_aware: locale != Some(false),
        })
    }

    fn path<'a>(&self, request: &'a InternalRequest, localized: &'a str) -> &'a str {
        if self.locale_aware {
            localized
        } else {
            &request.raw_path
        }
    }

    fn matches(&self, request: &InternalRequest, localized: &str) -> bool {
        self.regex.is_match(self.path(request, localized))
            && self.has.iter().all(|p| p.holds(request))
            && !self.missing.iter().any(|p| p.holds(request))
    }

    /// Source params, then `has` captures, then `missing` captures.
    fn params(&self, request: &InternalRequest, localized: &str) -> Params {
        let mut params = self
            .source
            .match_path(self.path(request, localized))
            .unwrap_or_default();
        for predicate in self.has.iter().chain(&self.missing) {
            predicate.captures(request, &mut params);
        }
        params
    }
}

/// A literal string that may carry `:param` placeholders.
#[derive(Debug, Clone)]
struct Template {
    raw: String,
    compiled: Option<PathTemplate>,
}

impl Template {
    fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let compiled = PathTemplate::parse(&raw)
            .ok()
            .filter(PathTemplate::has_params);
        Self { raw, compiled }
    }

    fn render(&self, params: &Params) -> String {
        match &self.compiled {
            Some(template) if !params.is_empty() => {
                template.compile(params).unwrap_or_else(|err| {
                    debug!(template = %self.raw, error = %err, "Template substitution failed");
                    self.raw.clone()
                })
            }
            _ => self.raw.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct Destination {
    /// `(protocol, host)` for absolute destinations.
    origin: Option<(String, Template)>,
    path: Template,
    query: Template,
}

impl Destination {
    fn parse(destination: &str) -> Self {
        if is_external(destination)
            && let Some(parts) = EXTERNAL_PARTS.captures(destination)
        {
            let group = |i: usize| parts.get(i).map(|m| m.as_str()).unwrap_or_default();
            return Self {
                origin: Some((group(1).to_string(), Template::new(group(2)))),
                path: Template::new(group(3)),
                query: Template::new(encode_plus(group(4).trim_start_matches('?'))),
            };
        }

        let (path, query) = split_url(destination);
        Self {
            origin: None,
            path: Template::new(path),
            query: Template::new(encode_plus(query)),
        }
    }

    fn is_external(&self) -> bool {
        self.origin.is_some()
    }

    /// Rendered `(url, query)`.
    fn render(&self, params: &Params) -> (String, String) {
        let path = self.path.render(params);
        let query = self.query.render(params);
        let url = match &self.origin {
            Some((protocol, host)) => format!("{protocol}//{}{path}", host.render(params)),
            None => path,
        };
        (url, query)
    }
}

/// `+` would otherwise be read as a literal plus by the query merge.
fn encode_plus(query: &str) -> String {
    query.replace('+', "%20")
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    matcher: RuleMatcher,
    destination: Destination,
}

impl RewriteRule {
    pub fn new(definition: &RewriteDefinition) -> Result<Self, RoutingError> {
        Ok(Self {
            matcher: RuleMatcher::new(
                &definition.regex,
                &definition.source,
                &definition.has,
                &definition.missing,
                definition.locale,
            )?,
            destination: Destination::parse(&definition.destination),
        })
    }

    pub fn source(&self) -> &str {
        self.matcher.source.source()
    }
}

#[derive(Debug, Clone)]
pub struct RedirectRule {
    rewrite: RewriteRule,
    status: u16,
}

impl RedirectRule {
    /// `internal` redirects never produce a response and yield `None`.
    pub fn new(definition: &RedirectDefinition) -> Result<Option<Self>, RoutingError> {
        if definition.internal {
            return Ok(None);
        }
        Ok(Some(Self {
            rewrite: RewriteRule::new(&definition.rule)?,
            status: definition.status_code.unwrap_or(DEFAULT_REDIRECT_STATUS),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct HeaderRule {
    matcher: RuleMatcher,
    headers: Vec<(Template, Template)>,
}

impl HeaderRule {
    pub fn new(definition: &HeaderDefinition) -> Result<Self, RoutingError> {
        Ok(Self {
            matcher: RuleMatcher::new(
                &definition.regex,
                &definition.source,
                &definition.has,
                &definition.missing,
                definition.locale,
            )?,
            headers: definition
                .headers
                .iter()
                .map(|pair| (Template::new(&pair.key), Template::new(&pair.value)))
                .collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub request: InternalRequest,
    /// Source template of the rule that fired.
    pub matched: Option<String>,
    pub is_external: bool,
}

/// Apply the first matching rule. Declaration order wins over specificity.
pub fn apply_rewrites(
    request: &InternalRequest,
    rules: &[RewriteRule],
    localized: &str,
) -> RewriteOutcome {
    let Some(rule) = rules.iter().find(|r| r.matcher.matches(request, localized)) else {
        return RewriteOutcome {
            request: request.clone(),
            matched: None,
            is_external: false,
        };
    };

    let params = rule.matcher.params(request, localized);
    let (url, query) = rule.destination.render(&params);

    let mut rewritten = request.clone();
    rewritten.raw_path = url;
    rewritten.query.merge(QueryParams::parse(&query));

    debug!(
        source = rule.source(),
        rewritten = %rewritten.url(),
        external = rule.destination.is_external(),
        "Rewrite applied"
    );

    RewriteOutcome {
        request: rewritten,
        matched: Some(rule.source().to_string()),
        is_external: rule.destination.is_external(),
    }
}

/// Trailing-slash normalization followed by the first matching redirect rule.
pub fn apply_redirects(
    request: &InternalRequest,
    rules: &[RedirectRule],
    localized: &str,
    options: &RuntimeOptions,
) -> Option<PreparedResponse> {
    if let Some(response) = trailing_slash_redirect(request, options) {
        return Some(response);
    }

    let rule = rules
        .iter()
        .find(|r| r.rewrite.matcher.matches(request, localized))?;
    let outcome = apply_rewrites(request, std::slice::from_ref(&rule.rewrite), localized);
    Some(PreparedResponse::redirect(rule.status, outcome.request.url()))
}

pub fn trailing_slash_redirect(
    request: &InternalRequest,
    options: &RuntimeOptions,
) -> Option<PreparedResponse> {
    let path = request.raw_path.as_str();
    // `//host` would resolve to another origin
    if path.starts_with("//") || options.skip_trailing_slash_redirect || path.starts_with("/api/") {
        return None;
    }

    let query = request.query.to_query_string();
    if options.trailing_slash
        && request.header("x-nextjs-data").is_none()
        && !path.ends_with('/')
        && !FILE_LIKE_PATH.is_match(path)
    {
        return Some(PreparedResponse::redirect(
            DEFAULT_REDIRECT_STATUS,
            format!("{path}/{query}"),
        ));
    }

    if !options.trailing_slash && path.ends_with('/') && path != "/" {
        let trimmed = &path[..path.len() - 1];
        return Some(PreparedResponse::redirect(
            DEFAULT_REDIRECT_STATUS,
            format!("{trimmed}{query}"),
        ));
    }
    None
}

/// Headers contributed by every matching header rule; later rules override earlier ones.
pub fn config_headers(
    request: &InternalRequest,
    rules: &[HeaderRule],
    localized: &str,
) -> Vec<(String, String)> {
    let mut collected: Vec<(String, String)> = Vec::new();
    for rule in rules.iter().filter(|r| r.matcher.matches(request, localized)) {
        let params = rule
            .matcher
            .source
            .match_path(rule.matcher.path(request, localized))
            .unwrap_or_default();
        for (key, value) in &rule.headers {
            let key = key.render(&params);
            let value = value.render(&params);
            collected.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&key));
            collected.push((key, value));
        }
    }
    collected
}

/// Map `/_next/data/<buildId>/<page>.json` onto the page path.
///
/// Data requests whose build segment is not exactly `build_id` break with a
/// JSON 404.
pub fn fix_data_page(
    mut request: InternalRequest,
    build_id: &str,
) -> ControlFlow<PreparedResponse, InternalRequest> {
    let Some(rest) = request.raw_path.strip_prefix(DATA_ROUTE_PREFIX) else {
        return ControlFlow::Continue(request);
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        return ControlFlow::Continue(request);
    }
    let Some(page) = rest
        .strip_prefix('/')
        .and_then(|rest| rest.strip_prefix(build_id))
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return ControlFlow::Break(
            PreparedResponse::new(404)
                .header("content-type", "application/json")
                .body("{}"),
        );
    };

    if let Some(page) = page.strip_suffix(".json") {
        request.raw_path = if page == "index" {
            "/".to_string()
        } else {
            format!("/{page}")
        };
        request.query.set(NEXT_DATA_QUERY, "1");
    }
    ControlFlow::Continue(request)
}

/// Route unknown paths of `fallback: false` dynamic routes to the 404 page.
///
/// Returns the possibly rewritten request and whether the path is ISR-backed.
pub fn fallback_false(
    mut request: InternalRequest,
    prerender: &PrerenderIndex,
    locales: &LocaleResolver,
) -> (InternalRequest, bool) {
    let route_fallback = prerender.fallback_false_matches(&request.raw_path);

    let localized = match locales.default_locale() {
        Some(default) if !locales.is_localized_path(&request.raw_path) => {
            format!("/{default}{}", request.raw_path)
        }
        _ => request.raw_path.clone(),
    };
    let pregenerated = prerender.is_pregenerated(&localized);

    if route_fallback && !pregenerated {
        request.raw_path = "/404".to_string();
        request.query = QueryParams::default();
        request
            .headers
            .insert("x-invoke-status".to_string(), "404".to_string());
        return (request, false);
    }
    (request, route_fallback || pregenerated)
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use isrgate_manifest::PrerenderManifest;

    use super::*;

    fn rewrite(source: &str, destination: &str, regex: &str) -> RewriteDefinition {
        RewriteDefinition {
            source: source.into(),
            destination: destination.into(),
            regex: regex.into(),
            has: Vec::new(),
            missing: Vec::new(),
            locale: None,
        }
    }

    fn request(url: &str) -> InternalRequest {
        InternalRequest::new(Method::GET, url)
    }

    fn rules(definitions: &[RewriteDefinition]) -> Vec<RewriteRule> {
        definitions
            .iter()
            .map(|d| RewriteRule::new(d).expect("rule compiles"))
            .collect()
    }

    #[test]
    fn rewrite_substitutes_params_and_keeps_query() {
        let rules = rules(&[rewrite("/old/:id", "/new/:id", "^/old/([^/]+?)(?:/)?$")]);
        let req = request("/old/42?x=1");

        let outcome = apply_rewrites(&req, &rules, &req.raw_path);

        assert_eq!(outcome.request.raw_path, "/new/42");
        assert_eq!(outcome.request.query.get("x"), Some("1"));
        assert_eq!(outcome.request.url(), "/new/42?x=1");
        assert_eq!(outcome.matched.as_deref(), Some("/old/:id"));
        assert!(!outcome.is_external);
    }

    #[test]
    fn first_declared_rule_wins() {
        let rules = rules(&[
            rewrite("/:path*", "/catch-all", "^(?:/(.*))?$"),
            rewrite("/blog/:slug", "/posts/:slug", "^/blog/([^/]+?)$"),
        ]);
        let req = request("/blog/hello");
        assert_eq!(apply_rewrites(&req, &rules, &req.raw_path).request.raw_path, "/catch-all");
    }

    #[test]
    fn destination_query_merges_over_incoming() {
        let rules = rules(&[rewrite(
            "/search/:term",
            "/find?q=:term&page=1",
            "^/search/([^/]+?)$",
        )]);
        let req = request("/search/rust?page=3&lang=en");

        let outcome = apply_rewrites(&req, &rules, &req.raw_path);

        assert_eq!(outcome.request.raw_path, "/find");
        assert_eq!(outcome.request.query.get("q"), Some("rust"));
        assert_eq!(outcome.request.query.get("page"), Some("1"));
        assert_eq!(outcome.request.query.get("lang"), Some("en"));
    }

    #[test]
    fn external_destination_is_flagged() {
        let rules = rules(&[rewrite(
            "/proxy/:path*",
            "https://upstream.example.com/:path*",
            "^/proxy(?:/(.*))?$",
        )]);
        let req = request("/proxy/a/b");

        let outcome = apply_rewrites(&req, &rules, &req.raw_path);

        assert!(outcome.is_external);
        assert_eq!(outcome.request.raw_path, "https://upstream.example.com/a/b");
    }

    #[test]
    fn has_and_missing_gate_the_rule() {
        let mut definition = rewrite("/dash", "/dash/:plan", "^/dash$");
        definition.has = vec![RouteHas {
            kind: HasKind::Cookie,
            key: "plan".into(),
            value: Some("(?<plan>pro|team)".into()),
        }];
        definition.missing = vec![RouteHas {
            kind: HasKind::Header,
            key: "X-Legacy".into(),
            value: None,
        }];
        let rules = rules(&[definition]);

        let pro = request("/dash").with_header("cookie", "plan=pro");
        let outcome = apply_rewrites(&pro, &rules, &pro.raw_path);
        assert_eq!(outcome.request.raw_path, "/dash/pro");

        let legacy = pro.clone().with_header("x-legacy", "1");
        assert!(apply_rewrites(&legacy, &rules, &legacy.raw_path).matched.is_none());

        let free = request("/dash").with_header("cookie", "plan=free");
        assert!(apply_rewrites(&free, &rules, &free.raw_path).matched.is_none());
    }

    #[test]
    fn query_predicate_requires_presence() {
        let mut definition = rewrite("/a", "/b", "^/a$");
        definition.has = vec![RouteHas {
            kind: HasKind::Query,
            key: "preview".into(),
            value: None,
        }];
        let rules = rules(&[definition]);

        let without = request("/a");
        assert!(apply_rewrites(&without, &rules, &without.raw_path).matched.is_none());
        let with = request("/a?preview=");
        assert!(apply_rewrites(&with, &rules, &with.raw_path).matched.is_some());
    }

    #[test]
    fn redirect_defaults_to_permanent_and_skips_internal() {
        let internal = RedirectDefinition {
            rule: rewrite("/a", "/internal", "^/a$"),
            status_code: None,
            internal: true,
        };
        let public = RedirectDefinition {
            rule: rewrite("/a", "/b", "^/a$"),
            status_code: None,
            internal: false,
        };
        let rules: Vec<RedirectRule> = [internal, public]
            .iter()
            .filter_map(|d| RedirectRule::new(d).expect("rule compiles"))
            .collect();
        let req = request("/a?x=1");

        let response = apply_redirects(&req, &rules, &req.raw_path, &RuntimeOptions::default())
            .expect("redirect fires");

        assert_eq!(response.status, 308);
        assert_eq!(response.header_value("location"), Some("/b?x=1"));
    }

    #[test]
    fn trailing_slash_rules() {
        let add = RuntimeOptions {
            trailing_slash: true,
            skip_trailing_slash_redirect: false,
        };
        let strip = RuntimeOptions::default();

        let response = trailing_slash_redirect(&request("/about?x=1"), &add).expect("adds slash");
        assert_eq!(response.header_value("location"), Some("/about/?x=1"));
        assert!(trailing_slash_redirect(&request("/file.txt"), &add).is_none());
        assert!(trailing_slash_redirect(&request("/api/thing"), &add).is_none());
        assert!(
            trailing_slash_redirect(&request("/about").with_header("x-nextjs-data", "1"), &add)
                .is_none()
        );

        let response = trailing_slash_redirect(&request("/about/"), &strip).expect("strips slash");
        assert_eq!(response.header_value("location"), Some("/about"));
        assert!(trailing_slash_redirect(&request("/"), &strip).is_none());
        assert!(trailing_slash_redirect(&request("//evil.example/"), &strip).is_none());

        let skip = RuntimeOptions {
            trailing_slash: false,
            skip_trailing_slash_redirect: true,
        };
        assert!(trailing_slash_redirect(&request("/about/"), &skip).is_none());
    }

    #[test]
    fn header_rules_template_values() {
        let definition: HeaderDefinition = serde_json::from_value(serde_json::json!({
            "source": "/blog/:slug",
            "regex": "^/blog/([^/]+?)$",
            "headers": [
                { "key": "x-post", "value": ":slug" },
                { "key": "cache-control", "value": "public, max-age=60" }
            ]
        }))
        .expect("definition parses");
        let rules = vec![HeaderRule::new(&definition).expect("rule compiles")];
        let req = request("/blog/hello");

        let headers = config_headers(&req, &rules, &req.raw_path);

        assert_eq!(
            headers,
            vec![
                ("x-post".to_string(), "hello".to_string()),
                ("cache-control".to_string(), "public, max-age=60".to_string()),
            ]
        );
    }

    #[test]
    fn data_page_for_foreign_build_is_not_found() {
        for path in [
            "/_next/data/OLDBUILD/test.json",
            "/_next/data/NEWBUILDX/test.json",
            "/_next/data/NEWBUILD",
            "/_next/data/NEW/test.json",
            "/_next/data",
        ] {
            let flow = fix_data_page(request(path), "NEWBUILD");
            let ControlFlow::Break(response) = flow else {
                panic!("expected a short-circuit response for {path}");
            };
            assert_eq!(response.status, 404);
            assert_eq!(response.body.as_ref(), b"{}");
            assert_eq!(response.header_value("content-type"), Some("application/json"));
        }
    }

    #[test]
    fn lookalike_prefix_is_not_a_data_route() {
        let ControlFlow::Continue(passed) = fix_data_page(request("/_next/database"), "NEWBUILD")
        else {
            panic!("expected the request to continue");
        };
        assert_eq!(passed.raw_path, "/_next/database");
    }

    #[test]
    fn data_page_maps_onto_page_path() {
        let ControlFlow::Continue(fixed) =
            fix_data_page(request("/_next/data/NEWBUILD/blog/post.json?x=1"), "NEWBUILD")
        else {
            panic!("expected the request to continue");
        };
        assert_eq!(fixed.raw_path, "/blog/post");
        assert_eq!(fixed.query.get(NEXT_DATA_QUERY), Some("1"));
        assert_eq!(fixed.query.get("x"), Some("1"));

        let ControlFlow::Continue(index) =
            fix_data_page(request("/_next/data/NEWBUILD/index.json"), "NEWBUILD")
        else {
            panic!("expected the request to continue");
        };
        assert_eq!(index.raw_path, "/");
    }

    #[test]
    fn fallback_false_routes_unknown_paths_to_404() {
        let manifest: PrerenderManifest = serde_json::from_value(serde_json::json!({
            "routes": { "/en/blog/known": { "initialRevalidateSeconds": 10 } },
            "dynamicRoutes": {
                "/blog/[slug]": { "routeRegex": "^/blog/([^/]+?)(?:/)?$", "fallback": false }
            }
        }))
        .expect("manifest parses");
        let prerender = PrerenderIndex::new(&manifest).expect("index compiles");
        let locales = LocaleResolver::new(Some(
            serde_json::from_value(serde_json::json!({
                "locales": ["en"], "defaultLocale": "en"
            }))
            .expect("i18n parses"),
        ));

        let (known, isr) = fallback_false(request("/blog/known"), &prerender, &locales);
        assert_eq!(known.raw_path, "/blog/known");
        assert!(isr);

        let (unknown, isr) = fallback_false(request("/blog/unknown?x=1"), &prerender, &locales);
        assert_eq!(unknown.raw_path, "/404");
        assert_eq!(unknown.url(), "/404");
        assert_eq!(unknown.header("x-invoke-status"), Some("404"));
        assert!(!isr);
    }
}
