//! Render pipeline backed by an HTTP origin.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Url};
use tracing::{debug, instrument};

use crate::{
    application::render::{ISR_HEADER, RenderError, RenderPipeline},
    routing::{PreparedResponse, RoutedRequest},
};

/// Headers that describe one hop and must not be forwarded.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct OriginRenderer {
    client: Client,
    origin: Url,
    timeout: Duration,
}

impl OriginRenderer {
    pub fn new(client: Client, origin: Url, timeout: Duration) -> Self {
        Self {
            client,
            origin,
            timeout,
        }
    }

    /// Where `routed` is sent: the rewrite target itself for external
    /// rewrites, else the request URL resolved against the origin.
    pub fn target(&self, routed: &RoutedRequest) -> Result<Url, RenderError> {
        let url = routed.request.url();
        let parsed = if routed.is_external_rewrite {
            Url::parse(&url)
        } else {
            self.origin.join(&url)
        };
        parsed.map_err(|_| RenderError::Target { target: url })
    }
}

#[async_trait]
impl RenderPipeline for OriginRenderer {
    #[instrument(skip_all, fields(path = %routed.request.raw_path, isr = routed.is_isr))]
    async fn render(
        &self,
        routed: &RoutedRequest,
        body: Bytes,
    ) -> Result<PreparedResponse, RenderError> {
        let target = self.target(routed)?;

        let mut headers = routed.request.header_map();
        for name in HOP_HEADERS {
            headers.remove(*name);
        }
        if let Some(host) = headers.remove("host")
            && !routed.is_external_rewrite
        {
            headers.insert("x-forwarded-host", host);
        }

        let mut request = self
            .client
            .request(routed.request.method.clone(), target.clone())
            .headers(headers)
            .timeout(self.timeout);
        if routed.is_isr {
            request = request.header(ISR_HEADER, "1");
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                RenderError::Timeout {
                    target: target.to_string(),
                }
            } else {
                RenderError::upstream(target.as_str(), err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let mut prepared = PreparedResponse::new(status);
        for (name, value) in response.headers() {
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                prepared = prepared.header(name.as_str(), value);
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| RenderError::upstream(target.as_str(), err.to_string()))?;

        debug!(target = %target, status, bytes = body.len(), "Origin responded");
        Ok(prepared.body(body))
    }

    fn name(&self) -> &'static str {
        "origin"
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;
    use crate::routing::InternalRequest;

    fn renderer() -> OriginRenderer {
        OriginRenderer::new(
            Client::new(),
            Url::parse("http://127.0.0.1:3001").expect("origin"),
            Duration::from_secs(1),
        )
    }

    fn routed(uri: &str, external: bool) -> RoutedRequest {
        RoutedRequest {
            request: InternalRequest::new(Method::GET, uri),
            headers: Vec::new(),
            is_external_rewrite: external,
            is_isr: false,
        }
    }

    #[test]
    fn internal_targets_resolve_against_origin() {
        let target = renderer()
            .target(&routed("/new/42?x=1", false))
            .expect("target");
        assert_eq!(target.as_str(), "http://127.0.0.1:3001/new/42?x=1");
    }

    #[test]
    fn external_rewrites_keep_their_host() {
        let target = renderer()
            .target(&routed("https://cdn.example.com/assets/a.js", true))
            .expect("target");
        assert_eq!(target.as_str(), "https://cdn.example.com/assets/a.js");
    }

    #[test]
    fn malformed_external_target_is_rejected() {
        let err = renderer()
            .target(&routed("https://", true))
            .expect_err("invalid");
        assert!(matches!(err, RenderError::Target { .. }));
    }
}
