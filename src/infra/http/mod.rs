//! HTTP surface: the routing layer in front of the render pipeline, plus
//! internal write-back routes.

mod internal;
mod middleware;
mod render;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::gateway::Gateway;

pub use middleware::RequestContext;

/// Upper bound for buffered request bodies forwarded to the renderer.
pub(crate) const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Prefix of the internal routes; these never pass through the routing layer.
pub const INTERNAL_PREFIX: &str = "/_isrgate";

#[derive(Clone)]
pub struct HttpState {
    pub gateway: Gateway,
}

pub fn build_router(state: HttpState) -> Router {
    let gated = Router::new()
        .fallback(render::render_request)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::route_request,
        ));

    let internal = Router::new()
        .route("/health", get(internal::health))
        .route(
            "/cache",
            get(internal::get_artifact)
                .put(internal::put_artifact)
                .delete(internal::delete_artifact),
        )
        .route("/revalidate-tags", post(internal::revalidate_tags))
        .route("/tags/expiration", get(internal::tag_expiration))
        .route(
            "/composable",
            get(internal::get_composable).put(internal::put_composable),
        );

    Router::new()
        .nest(INTERNAL_PREFIX, internal)
        .merge(gated)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
