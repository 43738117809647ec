//! Read path of the artifact cache.
//!
//! Decides per request whether a stored artifact can answer without the
//! render pipeline. Store and tag faults are logged and become misses; this
//! module never produces an error response of its own.

use std::sync::Arc;

use bytes::Bytes;
use isrgate_manifest::Revalidate;
use metrics::counter;
use tracing::{debug, warn};

use super::incremental::IncrementalCache;
use super::keys::{CacheKey, Namespace, Variant, content_digest, normalize_cache_path};
use super::record::ArtifactRecord;
use crate::queue::RevalidationDispatcher;
use crate::queue::consumer::REVALIDATE_HEADER;
use crate::routing::{InternalRequest, PreparedResponse, RoutingEngine};
use crate::util::clock::{elapsed_seconds, now_millis};

pub const CACHE_ONE_YEAR: u64 = 60 * 60 * 24 * 365;
pub const CACHE_ONE_MONTH: u64 = 60 * 60 * 24 * 30;

/// Diagnostic header reporting the cache decision.
pub const CACHE_STATUS_HEADER: &str = "x-isrgate-cache";

/// Server actions always bypass the cache.
const ACTION_HEADER: &str = "next-action";
const NO_STORE: &str = "private, no-cache, no-store, max-age=0, must-revalidate";
const DEFAULT_REDIRECT_STATUS: u16 = 307;

const METRIC_HIT: &str = "isrgate_cache_hit_total";
const METRIC_MISS: &str = "isrgate_cache_miss_total";
const METRIC_BYPASS: &str = "isrgate_cache_bypass_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Hit,
    Stale,
    /// Served with a zero revalidate window.
    Error,
}

impl CacheState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Stale => "STALE",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NotPrerendered,
    NotFound,
    TagRevalidated,
    StoreFault,
    Unservable,
}

impl MissReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotPrerendered => "not_prerendered",
            Self::NotFound => "not_found",
            Self::TagRevalidated => "tag_revalidated",
            Self::StoreFault => "store_fault",
            Self::Unservable => "unservable",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Interception {
    /// Forced regeneration or server action; the cache is not consulted.
    Bypass,
    Miss(MissReason),
    Hit {
        state: CacheState,
        response: PreparedResponse,
    },
}

/// Paths derived from one request.
struct CachePaths {
    /// Store key: base path and trailing slash stripped, root is `index`.
    key: String,
    /// Prerender manifest key: same as `key` except the root stays `/`.
    route: String,
}

impl CachePaths {
    fn new(localized: &str, base_path: &str) -> Self {
        let key = normalize_cache_path(localized, base_path);
        let route = if key == "index" { "/".to_string() } else { key.clone() };
        Self { key, route }
    }
}

pub struct CacheInterceptor {
    engine: Arc<RoutingEngine>,
    cache: Arc<IncrementalCache>,
    dispatcher: RevalidationDispatcher,
}

impl CacheInterceptor {
    pub fn new(
        engine: Arc<RoutingEngine>,
        cache: Arc<IncrementalCache>,
        dispatcher: RevalidationDispatcher,
    ) -> Self {
        Self {
            engine,
            cache,
            dispatcher,
        }
    }

    pub async fn intercept(&self, request: &InternalRequest) -> Interception {
        if self.is_bypass(request) {
            counter!(METRIC_BYPASS).increment(1);
            debug!(path = %request.raw_path, "Cache bypassed");
            return Interception::Bypass;
        }

        let localized = self.engine.locales().localize(request);
        let paths = CachePaths::new(&localized, self.engine.base_path());

        let outcome = self.lookup(request, &paths).await;
        match &outcome {
            Interception::Hit { state, .. } => {
                counter!(METRIC_HIT, "state" => state.as_str()).increment(1);
                debug!(path = %paths.key, state = state.as_str(), "Cache hit");
            }
            Interception::Miss(reason) => {
                counter!(METRIC_MISS, "reason" => reason.as_str()).increment(1);
                debug!(path = %paths.key, reason = reason.as_str(), "Cache miss");
            }
            Interception::Bypass => {}
        }
        outcome
    }

    /// A server action, or a revalidation credential matching the preview id.
    /// A wrong credential is ignored and the request goes through the lookup.
    fn is_bypass(&self, request: &InternalRequest) -> bool {
        if request.header(ACTION_HEADER).is_some() {
            return true;
        }
        request.header(REVALIDATE_HEADER).is_some_and(|presented| {
            self.engine
                .prerender()
                .accepts_preview_credential(presented.as_bytes())
        })
    }

    async fn lookup(&self, request: &InternalRequest, paths: &CachePaths) -> Interception {
        let prerender = self.engine.prerender();
        if !prerender.is_isr(&paths.route) && !prerender.is_isr(&paths.key) {
            return Interception::Miss(MissReason::NotPrerendered);
        }

        let key = CacheKey::new(
            self.engine.build_id(),
            paths.key.as_str(),
            Variant::detect(request),
        );
        let stored = match self.cache.get(&key.path, Namespace::Cache).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Interception::Miss(MissReason::NotFound),
            Err(err) => {
                warn!(key = %key.storage_key(), error = %err, "Artifact read failed");
                return Interception::Miss(MissReason::StoreFault);
            }
        };
        let record = stored.value;

        if matches!(record, ArtifactRecord::Image { .. } | ArtifactRecord::Fetch { .. }) {
            return Interception::Miss(MissReason::Unservable);
        }

        match self
            .cache
            .tag_index()
            .is_revalidated(&key.path, &record.tags(), stored.last_modified)
            .await
        {
            Ok(true) => return Interception::Miss(MissReason::TagRevalidated),
            Ok(false) => {}
            Err(err) => {
                warn!(path = %key.path, error = %err, "Tag lookup failed");
                return Interception::Miss(MissReason::StoreFault);
            }
        }

        let Some(served) = Served::from_record(&record, key.variant) else {
            return Interception::Miss(MissReason::Unservable);
        };

        let window = self.window(&record, &paths.route);
        let etag = content_digest(&served.body);
        let age = elapsed_seconds(stored.last_modified, now_millis());
        let (state, cache_control) = classify(window, age);

        if state == CacheState::Stale {
            self.enqueue_revalidation(request, paths, stored.last_modified, &etag);
        }

        let mut response = PreparedResponse::new(served.status)
            .header("cache-control", cache_control)
            .header(CACHE_STATUS_HEADER, state.as_str())
            .header("etag", etag);
        if let Some(content_type) = served.content_type {
            response = response.header("content-type", content_type);
        }
        if let Some(meta) = record.meta() {
            for (name, value) in &meta.headers {
                response.set_header(name, value.as_str());
            }
        }
        Interception::Hit {
            state,
            response: response.body(served.body),
        }
    }

    /// Record policy first, then the prerender manifest, else one year.
    fn window(&self, record: &ArtifactRecord, route: &str) -> Window {
        match record
            .revalidate()
            .or_else(|| self.engine.prerender().initial_revalidate(route))
        {
            Some(Revalidate::After(0)) => Window::Zero,
            Some(Revalidate::After(seconds)) if seconds < CACHE_ONE_YEAR => Window::Seconds(seconds),
            _ => Window::Forever,
        }
    }

    fn enqueue_revalidation(
        &self,
        request: &InternalRequest,
        paths: &CachePaths,
        last_modified: i64,
        etag: &str,
    ) {
        let mut url = paths.route.clone();
        if self.engine.options().trailing_slash && !url.ends_with('/') {
            url.push('/');
        }
        let url = format!("{}{url}", self.engine.base_path());
        let deduplication_id = content_digest(format!("{}-{last_modified}-{etag}", paths.key));

        let message = self
            .dispatcher
            .message(&paths.key, url, request.host(), deduplication_id);
        debug!(url = %message.url, group = %message.group_key, "Scheduling revalidation");
        self.dispatcher.enqueue(message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Zero,
    Seconds(u64),
    Forever,
}

/// The fresh side of the boundary is exclusive: `age == window` is stale.
fn classify(window: Window, age: u64) -> (CacheState, String) {
    match window {
        Window::Zero => (CacheState::Error, NO_STORE.to_string()),
        Window::Forever => (
            CacheState::Hit,
            format!("s-maxage={CACHE_ONE_YEAR}, stale-while-revalidate={CACHE_ONE_MONTH}"),
        ),
        Window::Seconds(window) => {
            let state = if age >= window {
                CacheState::Stale
            } else {
                CacheState::Hit
            };
            let remaining = window.saturating_sub(age);
            (
                state,
                format!("s-maxage={remaining}, stale-while-revalidate={CACHE_ONE_MONTH}"),
            )
        }
    }
}

/// The representation of a record chosen for a request.
struct Served {
    status: u16,
    content_type: Option<&'static str>,
    body: Bytes,
}

impl Served {
    fn from_record(record: &ArtifactRecord, variant: Variant) -> Option<Self> {
        let ok = |variant: Variant, body: Bytes| Self {
            status: 200,
            content_type: Some(variant.content_type()),
            body,
        };
        match record {
            ArtifactRecord::Page { html, json, .. } => Some(match variant {
                Variant::Json => ok(Variant::Json, Bytes::from(json.to_string())),
                Variant::Html | Variant::Rsc => ok(Variant::Html, Bytes::from(html.clone())),
            }),
            ArtifactRecord::App { html, rsc, .. } => Some(match variant {
                Variant::Rsc => ok(Variant::Rsc, Bytes::from(rsc.clone())),
                Variant::Html | Variant::Json => ok(Variant::Html, Bytes::from(html.clone())),
            }),
            ArtifactRecord::Route { body, meta, .. } => {
                let has_type = meta
                    .as_ref()
                    .is_some_and(|m| m.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")));
                Some(Self {
                    status: meta.as_ref().and_then(|m| m.status).unwrap_or(200),
                    content_type: (!has_type).then_some("application/octet-stream"),
                    body: body.clone(),
                })
            }
            ArtifactRecord::Redirect { meta, .. } => Some(Self {
                status: meta
                    .as_ref()
                    .and_then(|m| m.status)
                    .unwrap_or(DEFAULT_REDIRECT_STATUS),
                content_type: None,
                body: Bytes::new(),
            }),
            ArtifactRecord::Image { .. } | ArtifactRecord::Fetch { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use axum::http::Method;
    use serde_json::json;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::keys::StorageKey;
    use crate::cache::record::Meta;
    use crate::cache::store::MemoryArtifactStore;
    use crate::cache::tag_index::{OriginalTagIndex, TagIndex};
    use crate::cache::tag_store::MemoryPathTagStore;
    use crate::infra::manifests::BuildManifests;
    use crate::queue::MemoryQueue;

    struct Fixture {
        interceptor: CacheInterceptor,
        store: Arc<MemoryArtifactStore>,
        tags: Arc<OriginalTagIndex>,
        queue: Arc<MemoryQueue>,
    }

    fn fixture() -> Fixture {
        fixture_for(BuildManifests {
            build_id: "B1".into(),
            prerender: serde_json::from_value(json!({
                "routes": {
                    "/albums": { "initialRevalidateSeconds": 60 },
                    "/": { "initialRevalidateSeconds": false },
                    "/zero": { "initialRevalidateSeconds": 0 }
                },
                "dynamicRoutes": {},
                "preview": { "previewModeId": "secret" }
            }))
            .expect("prerender parses"),
            ..Default::default()
        })
    }

    fn fixture_for(manifests: BuildManifests) -> Fixture {
        let engine = Arc::new(RoutingEngine::new(&manifests).expect("engine builds"));
        let store = Arc::new(MemoryArtifactStore::new(&CacheConfig::default()));
        let tags = Arc::new(OriginalTagIndex::new(Arc::new(MemoryPathTagStore::new())));
        let cache = Arc::new(IncrementalCache::new("B1", store.clone(), tags.clone()));
        let queue = Arc::new(MemoryQueue::new(100));
        let dispatcher = RevalidationDispatcher::new(queue.clone(), 10);
        Fixture {
            interceptor: CacheInterceptor::new(engine, cache, dispatcher),
            store,
            tags,
            queue,
        }
    }

    fn put(store: &MemoryArtifactStore, path: &str, record: &ArtifactRecord, age_secs: i64) {
        store.insert_at(
            StorageKey::new(Namespace::Cache, "B1", path),
            record.encode().expect("encodes"),
            now_millis() - age_secs * 1000,
        );
    }

    fn page() -> ArtifactRecord {
        ArtifactRecord::Page {
            html: "<h1>albums</h1>".into(),
            json: json!({ "pageProps": { "n": 1 } }),
            meta: None,
            revalidate: None,
            tags: vec!["albums".into()],
        }
    }

    fn get(url: &str) -> InternalRequest {
        InternalRequest::new(Method::GET, url).with_header("host", "example.com")
    }

    async fn wait_for_queue(queue: &MemoryQueue, len: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while queue.len() < len {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queue reached expected length");
    }

    #[test]
    fn boundary_age_is_stale() {
        assert_eq!(classify(Window::Seconds(60), 59).0, CacheState::Hit);
        assert_eq!(classify(Window::Seconds(60), 60).0, CacheState::Stale);
        assert_eq!(
            classify(Window::Seconds(60), 90).1,
            "s-maxage=0, stale-while-revalidate=2592000"
        );
        assert_eq!(
            classify(Window::Seconds(60), 15).1,
            "s-maxage=45, stale-while-revalidate=2592000"
        );
        assert_eq!(classify(Window::Zero, 0).0, CacheState::Error);
    }

    #[tokio::test]
    async fn fresh_page_is_served_without_revalidation() {
        let fx = fixture();
        put(&fx.store, "/albums", &page(), 10);

        let Interception::Hit { state, response } = fx.interceptor.intercept(&get("/albums")).await
        else {
            panic!("expected hit");
        };
        assert_eq!(state, CacheState::Hit);
        assert_eq!(response.body, Bytes::from_static(b"<h1>albums</h1>"));
        assert_eq!(response.header_value(CACHE_STATUS_HEADER), Some("HIT"));
        assert_eq!(
            response.header_value("content-type"),
            Some("text/html; charset=utf-8")
        );
        tokio::task::yield_now().await;
        assert!(fx.queue.is_empty());
    }

    #[tokio::test]
    async fn stale_page_is_served_and_revalidated_once() {
        let fx = fixture();
        put(&fx.store, "/albums", &page(), 90);

        let Interception::Hit { state, response } = fx.interceptor.intercept(&get("/albums")).await
        else {
            panic!("expected hit");
        };
        assert_eq!(state, CacheState::Stale);
        assert!(
            response
                .header_value("cache-control")
                .is_some_and(|v| v.starts_with("s-maxage=0"))
        );

        wait_for_queue(&fx.queue, 1).await;
        let messages = fx.queue.drain(10);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].group_key, "revalidate-3");
        assert_eq!(messages[0].url, "/albums");
        assert_eq!(messages[0].host, "example.com");
    }

    #[tokio::test]
    async fn data_request_gets_json() {
        let fx = fixture();
        put(&fx.store, "/albums", &page(), 1);

        let Interception::Hit { response, .. } = fx
            .interceptor
            .intercept(&get("/albums?__nextDataReq=1"))
            .await
        else {
            panic!("expected hit");
        };
        assert_eq!(response.header_value("content-type"), Some("application/json"));
        assert_eq!(response.body, Bytes::from(r#"{"pageProps":{"n":1}}"#));
    }

    #[tokio::test]
    async fn tag_revalidation_forces_miss() {
        let fx = fixture();
        let record = page();
        put(&fx.store, "/albums", &record, 1);
        fx.tags
            .associate("/albums", &record.tags())
            .await
            .expect("associate");
        fx.tags
            .expire_tags(&["albums".to_string()])
            .await
            .expect("expire");

        assert!(matches!(
            fx.interceptor.intercept(&get("/albums")).await,
            Interception::Miss(MissReason::TagRevalidated)
        ));
    }

    #[tokio::test]
    async fn bypass_headers_skip_the_store() {
        let fx = fixture();
        put(&fx.store, "/albums", &page(), 1);

        let request = get("/albums").with_header("x-prerender-revalidate", "secret");
        assert!(matches!(
            fx.interceptor.intercept(&request).await,
            Interception::Bypass
        ));
        assert_eq!(fx.store.reads(), 0);

        let action = get("/albums").with_header("next-action", "abc");
        assert!(matches!(
            fx.interceptor.intercept(&action).await,
            Interception::Bypass
        ));
    }

    #[tokio::test]
    async fn wrong_revalidate_credential_is_served_from_cache() {
        let fx = fixture();
        put(&fx.store, "/albums", &page(), 1);

        for presented in ["not-the-secret", "", "secret "] {
            let request = get("/albums").with_header("x-prerender-revalidate", presented);
            let Interception::Hit { state, .. } = fx.interceptor.intercept(&request).await else {
                panic!("expected hit for credential {presented:?}");
            };
            assert_eq!(state, CacheState::Hit);
        }
    }

    #[tokio::test]
    async fn locale_prefix_spelling_shares_one_artifact() {
        let fx = fixture_for(BuildManifests {
            build_id: "B1".into(),
            routes: serde_json::from_value(json!({
                "i18n": { "locales": ["en", "fr"], "defaultLocale": "en" }
            }))
            .expect("routes parse"),
            prerender: serde_json::from_value(json!({
                "routes": { "/fr/albums": { "initialRevalidateSeconds": 60 } },
                "preview": { "previewModeId": "secret" }
            }))
            .expect("prerender parses"),
            ..Default::default()
        });
        put(&fx.store, "/fr/albums", &page(), 1);

        for path in ["/fr/albums", "/FR/albums", "/Fr/albums/"] {
            let Interception::Hit { state, response } = fx.interceptor.intercept(&get(path)).await
            else {
                panic!("expected hit for {path}");
            };
            assert_eq!(state, CacheState::Hit);
            assert_eq!(response.body, Bytes::from_static(b"<h1>albums</h1>"));
        }
    }

    #[tokio::test]
    async fn unknown_path_misses_without_store_access() {
        let fx = fixture();
        assert!(matches!(
            fx.interceptor.intercept(&get("/contact")).await,
            Interception::Miss(MissReason::NotPrerendered)
        ));
        assert_eq!(fx.store.reads(), 0);
    }

    #[tokio::test]
    async fn corrupt_record_is_a_miss() {
        let fx = fixture();
        fx.store.insert_at(
            StorageKey::new(Namespace::Cache, "B1", "/albums"),
            Bytes::from_static(b"{"),
            now_millis(),
        );
        assert!(matches!(
            fx.interceptor.intercept(&get("/albums")).await,
            Interception::Miss(MissReason::StoreFault)
        ));
    }

    #[tokio::test]
    async fn root_never_goes_stale() {
        let fx = fixture();
        put(&fx.store, "index", &page(), 10_000_000);

        let Interception::Hit { state, response } = fx.interceptor.intercept(&get("/")).await else {
            panic!("expected hit");
        };
        assert_eq!(state, CacheState::Hit);
        assert_eq!(
            response.header_value("cache-control"),
            Some("s-maxage=31536000, stale-while-revalidate=2592000")
        );
    }

    #[tokio::test]
    async fn zero_window_is_served_uncacheable() {
        let fx = fixture();
        put(&fx.store, "/zero", &page(), 0);

        let Interception::Hit { state, response } = fx.interceptor.intercept(&get("/zero")).await
        else {
            panic!("expected hit");
        };
        assert_eq!(state, CacheState::Error);
        assert_eq!(response.header_value("cache-control"), Some(NO_STORE));
    }

    #[tokio::test]
    async fn redirect_record_uses_stored_status_and_headers() {
        let fx = fixture();
        let record = ArtifactRecord::Redirect {
            props: None,
            meta: Some(Meta {
                status: None,
                headers: BTreeMap::from([("location".into(), "/elsewhere".into())]),
            }),
            revalidate: Some(Revalidate::After(60)),
        };
        put(&fx.store, "/albums", &record, 1);

        let Interception::Hit { response, .. } = fx.interceptor.intercept(&get("/albums")).await
        else {
            panic!("expected hit");
        };
        assert_eq!(response.status, 307);
        assert_eq!(response.header_value("location"), Some("/elsewhere"));
        assert!(response.body.is_empty());
    }
}
