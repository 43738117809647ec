use axum::{
    body::{self, Body},
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::{HttpState, MAX_BODY_BYTES};
use crate::{
    application::error::HttpError,
    routing::{InternalRequest, RoutedRequest},
};

/// Fallback handler: hand the routed request to the render pipeline.
pub async fn render_request(State(state): State<HttpState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    // Requests that did not pass through the routing layer are rendered as-is.
    let routed = match parts.extensions.get::<RoutedRequest>() {
        Some(routed) => routed.clone(),
        None => RoutedRequest {
            request: InternalRequest::from_parts(&parts, Default::default()),
            headers: Vec::new(),
            is_external_rewrite: false,
            is_isr: false,
        },
    };

    let body = match body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return HttpError::new(
                "infra::http::render",
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                err.to_string(),
            )
            .into_response();
        }
    };

    match state.gateway.render.render(&routed, body).await {
        Ok(response) => {
            debug!(
                path = %routed.request.raw_path,
                status = response.status,
                renderer = state.gateway.render.name(),
                "Rendered"
            );
            response.into_response()
        }
        Err(err) => HttpError::from(err).into_response(),
    }
}
