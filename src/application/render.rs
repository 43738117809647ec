//! The render pipeline invoked when the cache cannot answer a request.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::routing::{PreparedResponse, RoutedRequest};

pub use crate::queue::consumer::ISR_HEADER;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render target `{target}` is not a valid URL")]
    Target { target: String },
    #[error("render request to `{target}` timed out")]
    Timeout { target: String },
    #[error("render request to `{target}` failed: {message}")]
    Upstream { target: String, message: String },
}

impl RenderError {
    pub fn upstream(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            target: target.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait RenderPipeline: Send + Sync {
    /// Produce a response for a request the routing stages forwarded.
    async fn render(
        &self,
        routed: &RoutedRequest,
        body: Bytes,
    ) -> Result<PreparedResponse, RenderError>;

    fn name(&self) -> &'static str;
}
