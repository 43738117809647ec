use std::ops::ControlFlow;

use isrgate_manifest::{RewriteDefinition, RuntimeOptions};
use tracing::debug;

use super::{
    RoutingError,
    i18n::LocaleResolver,
    matcher::{
        HeaderRule, RedirectRule, RewriteRule, apply_redirects, apply_rewrites, config_headers,
        fallback_false, fix_data_page,
    },
    prerender::PrerenderIndex,
    request::{InternalRequest, PreparedResponse},
    route_table::RouteTable,
};
use crate::infra::manifests::BuildManifests;

/// Outcome of the routing stages for one request.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Answer immediately (redirect, foreign data route).
    Respond(PreparedResponse),
    /// Continue to the cache interceptor and render pipeline.
    Forward(RoutedRequest),
}

#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub request: InternalRequest,
    /// Config headers to append to the final response.
    pub headers: Vec<(String, String)>,
    pub is_external_rewrite: bool,
    pub is_isr: bool,
}

/// Routing decisions compiled from the build manifests.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    build_id: String,
    base_path: String,
    options: RuntimeOptions,
    routes: RouteTable,
    locales: LocaleResolver,
    prerender: PrerenderIndex,
    headers: Vec<HeaderRule>,
    redirects: Vec<RedirectRule>,
    before_files: Vec<RewriteRule>,
    after_files: Vec<RewriteRule>,
    fallback: Vec<RewriteRule>,
}

impl RoutingEngine {
    pub fn new(manifests: &BuildManifests) -> Result<Self, RoutingError> {
        let routes = &manifests.routes;

        let mut redirects = Vec::with_capacity(routes.redirects.len());
        for definition in &routes.redirects {
            if let Some(rule) = RedirectRule::new(definition)? {
                redirects.push(rule);
            }
        }

        Ok(Self {
            build_id: manifests.build_id.clone(),
            base_path: routes.base_path.clone(),
            options: manifests.options.clone(),
            routes: RouteTable::new(routes, &manifests.app_paths, &manifests.pages)?,
            locales: LocaleResolver::new(routes.i18n.clone()),
            prerender: PrerenderIndex::new(&manifests.prerender)?,
            headers: routes
                .headers
                .iter()
                .map(HeaderRule::new)
                .collect::<Result<Vec<_>, _>>()?,
            redirects,
            before_files: compile_rewrites(&routes.rewrites.before_files)?,
            after_files: compile_rewrites(&routes.rewrites.after_files)?,
            fallback: compile_rewrites(&routes.rewrites.fallback)?,
        })
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn locales(&self) -> &LocaleResolver {
        &self.locales
    }

    pub fn prerender(&self) -> &PrerenderIndex {
        &self.prerender
    }

    /// Run the routing stages in order: config headers, data-route fix,
    /// fallback-false, redirects, then the three rewrite phases.
    pub fn resolve(&self, request: InternalRequest) -> Resolution {
        let localized = self.locales.localize(&request);
        let headers = config_headers(&request, &self.headers, &localized);

        let request = match fix_data_page(request, &self.build_id) {
            ControlFlow::Break(response) => {
                debug!(build_id = %self.build_id, "Data request for another build");
                return Resolution::Respond(response);
            }
            ControlFlow::Continue(request) => request,
        };

        let (mut request, is_isr) = fallback_false(request, &self.prerender, &self.locales);

        let localized = self.locales.localize(&request);
        if let Some(redirect) = apply_redirects(&request, &self.redirects, &localized, &self.options)
        {
            debug!(
                path = %request.raw_path,
                status = redirect.status,
                location = redirect.header_value("location").unwrap_or_default(),
                "Redirecting"
            );
            return Resolution::Respond(redirect);
        }

        let is_static = self.routes.is_static(&request.raw_path);
        let is_dynamic = self.routes.is_dynamic(&request.raw_path);

        let outcome = apply_rewrites(&request, &self.before_files, &localized);
        request = outcome.request;
        let mut is_external_rewrite = outcome.is_external;

        if !is_static && !is_external_rewrite {
            let localized = self.locales.localize(&request);
            let outcome = apply_rewrites(&request, &self.after_files, &localized);
            request = outcome.request;
            is_external_rewrite = outcome.is_external;
        }

        if !is_static && !is_dynamic && !is_external_rewrite {
            let localized = self.locales.localize(&request);
            let outcome = apply_rewrites(&request, &self.fallback, &localized);
            request = outcome.request;
            is_external_rewrite = outcome.is_external;
        }

        if !is_external_rewrite {
            match self.routes.resolve(&self.locales.localize(&request)) {
                Some(route) => debug!(
                    path = %request.raw_path,
                    route = %route.route,
                    kind = ?route.kind,
                    "Route resolved"
                ),
                None => debug!(path = %request.raw_path, "No manifest route matched"),
            }
        }

        Resolution::Forward(RoutedRequest {
            request,
            headers,
            is_external_rewrite,
            is_isr,
        })
    }
}

fn compile_rewrites(definitions: &[RewriteDefinition]) -> Result<Vec<RewriteRule>, RoutingError> {
    definitions.iter().map(RewriteRule::new).collect()
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;

    fn manifests() -> BuildManifests {
        BuildManifests {
            build_id: "NEWBUILD".into(),
            routes: serde_json::from_value(serde_json::json!({
                "staticRoutes": [{ "page": "/about", "regex": "^/about(?:/)?$" }],
                "dynamicRoutes": [{ "page": "/blog/[slug]", "regex": "^/blog/([^/]+?)(?:/)?$" }],
                "redirects": [{
                    "source": "/legacy", "destination": "/about",
                    "regex": "^/legacy$", "statusCode": 301
                }],
                "rewrites": {
                    "beforeFiles": [{ "source": "/old/:id", "destination": "/new/:id", "regex": "^/old/([^/]+?)$" }],
                    "afterFiles": [{ "source": "/about", "destination": "/shadowed", "regex": "^/about$" }],
                    "fallback": [{
                        "source": "/missing/:rest*", "destination": "/catch/:rest*",
                        "regex": "^/missing(?:/(.*))?$"
                    }]
                },
                "headers": [{
                    "source": "/:path*", "regex": "^(?:/(.*))?$",
                    "headers": [{ "key": "x-powered-by", "value": "isrgate" }]
                }]
            }))
            .expect("routes parse"),
            prerender: Default::default(),
            app_paths: Default::default(),
            pages: Default::default(),
            options: Default::default(),
        }
    }

    fn engine() -> RoutingEngine {
        RoutingEngine::new(&manifests()).expect("engine compiles")
    }

    fn forward(resolution: Resolution) -> RoutedRequest {
        match resolution {
            Resolution::Forward(routed) => routed,
            Resolution::Respond(response) => panic!("unexpected response {response:?}"),
        }
    }

    #[test]
    fn before_files_rewrite_keeps_query() {
        let routed = forward(engine().resolve(InternalRequest::new(Method::GET, "/old/42?x=1")));
        assert_eq!(routed.request.raw_path, "/new/42");
        assert_eq!(routed.request.query.get("x"), Some("1"));
        assert_eq!(routed.headers, vec![("x-powered-by".into(), "isrgate".into())]);
        assert!(!routed.is_external_rewrite);
    }

    #[test]
    fn static_routes_skip_after_files() {
        let routed = forward(engine().resolve(InternalRequest::new(Method::GET, "/about")));
        assert_eq!(routed.request.raw_path, "/about");
    }

    #[test]
    fn fallback_only_when_nothing_matches() {
        let engine = engine();
        let dynamic = forward(engine.resolve(InternalRequest::new(Method::GET, "/blog/x")));
        assert_eq!(dynamic.request.raw_path, "/blog/x");

        let unknown = forward(engine.resolve(InternalRequest::new(Method::GET, "/missing/page")));
        assert_eq!(unknown.request.raw_path, "/catch/page");
    }

    #[test]
    fn redirect_short_circuits() {
        let Resolution::Respond(response) =
            engine().resolve(InternalRequest::new(Method::GET, "/legacy"))
        else {
            panic!("expected a redirect");
        };
        assert_eq!(response.status, 301);
        assert_eq!(response.header_value("location"), Some("/about"));
    }

    #[test]
    fn foreign_build_data_request_is_not_found() {
        let Resolution::Respond(response) = engine().resolve(InternalRequest::new(
            Method::GET,
            "/_next/data/OLDBUILD/test.json",
        )) else {
            panic!("expected a 404");
        };
        assert_eq!(response.status, 404);
    }
}
