use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::HttpState;
use crate::{
    application::error::ErrorReport,
    cache::{CACHE_STATUS_HEADER, Interception},
    routing::{InternalRequest, Resolution},
};

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

/// Routing stages and cache lookup in front of the render handler.
///
/// Short-circuit responses never reach `next`; forwarded requests carry their
/// [`RoutedRequest`](crate::routing::RoutedRequest) as an extension.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn route_request(
    State(state): State<HttpState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let internal = InternalRequest::from_parts(&parts, Bytes::new());

    let routed = match state.gateway.engine.resolve(internal) {
        Resolution::Respond(response) => return response.into_response(),
        Resolution::Forward(routed) => routed,
    };

    let mut cache_status = None;
    if routed.is_external_rewrite {
        debug!(target_url = %routed.request.url(), "External rewrite skips the cache");
    } else {
        match state.gateway.interceptor.intercept(&routed.request).await {
            Interception::Hit { response, .. } => {
                let mut response = response.into_response();
                append_headers(&mut response, &routed.headers);
                return response;
            }
            Interception::Miss(_) => cache_status = Some("MISS"),
            Interception::Bypass => {}
        }
    }

    let config_headers = routed.headers.clone();
    parts.extensions.insert(routed);
    let mut response = next.run(Request::from_parts(parts, body)).await;

    if let Some(status) = cache_status
        && !response.headers().contains_key(CACHE_STATUS_HEADER)
    {
        response
            .headers_mut()
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static(status));
    }
    append_headers(&mut response, &config_headers);
    response
}

fn append_headers(response: &mut Response, headers: &[(String, String)]) {
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!(header = %name, "Skipping config header with invalid name or value"),
        }
    }
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        error!(
            target = "isrgate::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms = elapsed_ms,
            source = source,
            detail = %detail,
            chain = ?messages,
            request_id = request_id,
            "request failed",
        );
    } else if let Some(report) = response.extensions_mut().remove::<ErrorReport>() {
        warn!(
            target = "isrgate::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            source = report.source,
            chain = ?report.messages,
            request_id = request_id,
            "client request error",
        );
    }

    response
}
