use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::{
    Router,
    body::{self, Body},
    http::{Request, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use isrgate::{
    application::{
        gateway::Gateway,
        render::{RenderError, RenderPipeline},
    },
    cache::{ArtifactRecord, CacheConfig, StoreBackend},
    infra::{
        http::{self, HttpState},
        manifests::BuildManifests,
    },
    queue::{QueueError, RevalidationMessage, Revalidator},
    routing::{PreparedResponse, RoutedRequest, RoutingEngine},
};
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

const PREVIEW_ID: &str = "preview-secret";

#[derive(Default)]
struct RecordingRenderer {
    seen: Mutex<Vec<RoutedRequest>>,
}

impl RecordingRenderer {
    fn seen(&self) -> Vec<RoutedRequest> {
        self.seen.lock().expect("renderer lock").clone()
    }
}

#[async_trait]
impl RenderPipeline for RecordingRenderer {
    async fn render(
        &self,
        routed: &RoutedRequest,
        _body: Bytes,
    ) -> Result<PreparedResponse, RenderError> {
        self.seen.lock().expect("renderer lock").push(routed.clone());
        Ok(PreparedResponse::new(200)
            .header("content-type", "text/plain")
            .body(format!("rendered {}", routed.request.url())))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[derive(Default)]
struct RecordingRevalidator {
    seen: Mutex<Vec<RevalidationMessage>>,
}

#[async_trait]
impl Revalidator for RecordingRevalidator {
    async fn revalidate(&self, message: &RevalidationMessage) -> Result<(), QueueError> {
        self.seen
            .lock()
            .expect("revalidator lock")
            .push(message.clone());
        Ok(())
    }
}

struct Harness {
    router: Router,
    gateway: Gateway,
    renderer: Arc<RecordingRenderer>,
    revalidator: Arc<RecordingRevalidator>,
    root: TempDir,
}

fn manifests() -> BuildManifests {
    BuildManifests {
        build_id: "NEWBUILD".into(),
        routes: serde_json::from_value(json!({
            "staticRoutes": [
                { "page": "/", "regex": "^/(?:/)?$" },
                { "page": "/albums", "regex": "^/albums(?:/)?$" }
            ],
            "dynamicRoutes": [
                { "page": "/new/[id]", "regex": "^/new/([^/]+?)(?:/)?$" }
            ],
            "redirects": [{
                "source": "/legacy", "destination": "/albums",
                "regex": "^/legacy$", "statusCode": 301
            }],
            "rewrites": {
                "beforeFiles": [{ "source": "/old/:id", "destination": "/new/:id", "regex": "^/old/([^/]+?)$" }],
                "afterFiles": [],
                "fallback": []
            },
            "headers": [{
                "source": "/:path*", "regex": "^(?:/(.*))?$",
                "headers": [{ "key": "x-powered-by", "value": "isrgate" }]
            }]
        }))
        .expect("routes manifest parses"),
        prerender: serde_json::from_value(json!({
            "routes": {
                "/": { "initialRevalidateSeconds": false },
                "/albums": { "initialRevalidateSeconds": 60 }
            },
            "dynamicRoutes": {},
            "preview": { "previewModeId": PREVIEW_ID }
        }))
        .expect("prerender manifest parses"),
        ..Default::default()
    }
}

fn harness() -> Harness {
    let root = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(RoutingEngine::new(&manifests()).expect("engine compiles"));
    let config = CacheConfig {
        backend: StoreBackend::Fs,
        fs_root: root.path().to_path_buf(),
        ..Default::default()
    };
    let renderer = Arc::new(RecordingRenderer::default());
    let revalidator = Arc::new(RecordingRevalidator::default());

    let gateway = Gateway::assemble(engine, config, renderer.clone(), revalidator.clone());
    let router = http::build_router(HttpState {
        gateway: gateway.clone(),
    });

    Harness {
        router,
        gateway,
        renderer,
        revalidator,
        root,
    }
}

fn albums_page(tags: Vec<String>) -> ArtifactRecord {
    ArtifactRecord::Page {
        html: "<h1>Albums</h1>".into(),
        json: json!({ "pageProps": { "albums": 3 } }),
        meta: None,
        revalidate: None,
        tags,
    }
}

impl Harness {
    async fn get(&self, uri: &str) -> Response {
        self.send(
            Request::builder()
                .uri(uri)
                .header(header::HOST, "example.com")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    /// Move the stored file's mtime `secs` into the past.
    fn backdate(&self, object_path: &str, secs: u64) {
        let path = self.root.path().join(object_path);
        let file = std::fs::File::options()
            .write(true)
            .open(&path)
            .expect("stored artifact exists");
        file.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .expect("mtime updated");
    }

    async fn wait_for_queue(&self, len: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.gateway.queue.len() < len {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("revalidation enqueued");
    }
}

fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn body_string(response: Response) -> String {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body collects");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

#[tokio::test]
async fn data_route_for_another_build_is_not_found() {
    let harness = harness();

    for uri in [
        "/_next/data/OLDBUILD/test.json",
        "/_next/data/NEWBUILDX/test.json",
    ] {
        let response = harness.get(uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
    assert!(harness.renderer.seen().is_empty());
}

#[tokio::test]
async fn before_files_rewrite_reaches_the_renderer() {
    let harness = harness();

    let response = harness.get("/old/42?x=1").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-powered-by"), Some("isrgate"));
    assert_eq!(header_str(&response, "x-isrgate-cache"), Some("MISS"));

    let seen = harness.renderer.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].request.raw_path, "/new/42");
    assert_eq!(seen[0].request.query.get("x"), Some("1"));
    assert!(!seen[0].is_external_rewrite);
    assert_eq!(body_string(response).await, "rendered /new/42?x=1");
}

#[tokio::test]
async fn redirects_answer_without_rendering() {
    let harness = harness();

    let response = harness.get("/legacy").await;

    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(header_str(&response, "location"), Some("/albums"));
    assert!(harness.renderer.seen().is_empty());
}

#[tokio::test]
async fn stale_albums_page_is_served_and_revalidated_once() {
    let harness = harness();
    harness
        .gateway
        .incremental
        .set("/albums", &albums_page(vec![]))
        .await
        .expect("artifact stored");
    harness.backdate("cache/NEWBUILD/albums.cache", 120);

    let response = harness.get("/albums").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-isrgate-cache"), Some("STALE"));
    assert_eq!(
        header_str(&response, "cache-control"),
        Some("s-maxage=0, stale-while-revalidate=2592000")
    );
    assert_eq!(
        header_str(&response, "content-type"),
        Some("text/html; charset=utf-8")
    );
    assert_eq!(header_str(&response, "x-powered-by"), Some("isrgate"));
    assert_eq!(body_string(response).await, "<h1>Albums</h1>");
    assert!(harness.renderer.seen().is_empty());

    harness.wait_for_queue(1).await;
    assert_eq!(harness.gateway.consumer.consume().await, 1);

    let seen = harness.revalidator.seen.lock().expect("lock").clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].url, "/albums");
    assert_eq!(seen[0].host, "example.com");
    assert_eq!(seen[0].group_key, "revalidate-3");
}

#[tokio::test]
async fn fresh_albums_page_is_a_hit() {
    let harness = harness();
    harness
        .gateway
        .incremental
        .set("/albums", &albums_page(vec![]))
        .await
        .expect("artifact stored");

    let response = harness.get("/albums").await;

    assert_eq!(header_str(&response, "x-isrgate-cache"), Some("HIT"));
    assert!(
        header_str(&response, "etag").is_some_and(|etag| etag.len() == 64),
        "etag is a hex digest"
    );
    assert!(harness.gateway.queue.is_empty());
}

#[tokio::test]
async fn root_page_without_revalidate_never_goes_stale() {
    let harness = harness();
    harness
        .gateway
        .incremental
        .set("index", &albums_page(vec![]))
        .await
        .expect("artifact stored");
    harness.backdate("cache/NEWBUILD/index.cache", 60 * 60 * 24 * 30);

    let response = harness.get("/").await;

    assert_eq!(header_str(&response, "x-isrgate-cache"), Some("HIT"));
    assert_eq!(
        header_str(&response, "cache-control"),
        Some("s-maxage=31536000, stale-while-revalidate=2592000")
    );
}

#[tokio::test]
async fn revalidate_header_bypasses_the_cache() {
    let harness = harness();
    harness
        .gateway
        .incremental
        .set("/albums", &albums_page(vec![]))
        .await
        .expect("artifact stored");

    let response = harness
        .send(
            Request::builder()
                .uri("/albums")
                .header("x-prerender-revalidate", PREVIEW_ID)
                .body(Body::empty())
                .expect("request builds"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(header_str(&response, "x-isrgate-cache").is_none());
    assert_eq!(harness.renderer.seen().len(), 1);
}

#[tokio::test]
async fn wrong_revalidate_credential_is_served_from_cache() {
    let harness = harness();
    harness
        .gateway
        .incremental
        .set("/albums", &albums_page(vec![]))
        .await
        .expect("artifact stored");

    let response = harness
        .send(
            Request::builder()
                .uri("/albums")
                .header(header::HOST, "example.com")
                .header("x-prerender-revalidate", "not-the-secret")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-isrgate-cache"), Some("HIT"));
    assert!(harness.renderer.seen().is_empty());
}

#[tokio::test]
async fn write_back_requires_the_preview_credential() {
    let harness = harness();
    let body = serde_json::to_vec(&albums_page(vec![])).expect("record encodes");

    let rejected = harness
        .send(
            Request::builder()
                .method("PUT")
                .uri("/_isrgate/cache?key=/albums")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.clone()))
                .expect("request builds"),
        )
        .await;
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

    let accepted = harness
        .send(
            Request::builder()
                .method("PUT")
                .uri("/_isrgate/cache?key=/albums")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-prerender-revalidate", PREVIEW_ID)
                .body(Body::from(body))
                .expect("request builds"),
        )
        .await;
    assert_eq!(accepted.status(), StatusCode::NO_CONTENT);

    let response = harness.get("/albums").await;
    assert_eq!(header_str(&response, "x-isrgate-cache"), Some("HIT"));
}

#[tokio::test]
async fn revalidated_tag_sends_the_page_back_to_the_renderer() {
    let harness = harness();
    harness
        .gateway
        .incremental
        .set("/albums", &albums_page(vec!["albums".into()]))
        .await
        .expect("artifact stored");
    harness.backdate("cache/NEWBUILD/albums.cache", 5);

    let response = harness
        .send(
            Request::builder()
                .method("POST")
                .uri("/_isrgate/revalidate-tags")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-prerender-revalidate", PREVIEW_ID)
                .body(Body::from(r#"{"tags":["albums"]}"#))
                .expect("request builds"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = harness.get("/albums").await;

    assert_eq!(header_str(&response, "x-isrgate-cache"), Some("MISS"));
    assert_eq!(body_string(response).await, "rendered /albums");
    assert_eq!(harness.renderer.seen().len(), 1);
}

#[tokio::test]
async fn composable_entries_round_trip_through_the_internal_routes() {
    let harness = harness();
    let entry = json!({
        "value": "Y2h1bms=",
        "tags": ["nav"],
        "timestamp": 1,
        "expire": 600,
        "stale": 0,
        "revalidate": 60
    });

    let response = harness
        .send(
            Request::builder()
                .method("PUT")
                .uri("/_isrgate/composable?key=nav")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-prerender-revalidate", PREVIEW_ID)
                .body(Body::from(entry.to_string()))
                .expect("request builds"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = harness
        .send(
            Request::builder()
                .uri("/_isrgate/composable?key=nav")
                .header("x-prerender-revalidate", PREVIEW_ID)
                .body(Body::empty())
                .expect("request builds"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let fetched: serde_json::Value =
        serde_json::from_str(&body_string(response).await).expect("json body");
    assert_eq!(fetched["value"], "Y2h1bms=");
    assert_eq!(fetched["tags"], json!(["nav"]));
}
