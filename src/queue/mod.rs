//! Background revalidation.
//!
//! Stale reads produce a [`RevalidationMessage`]; the [`RevalidationDispatcher`]
//! hands it to a [`Queue`] without blocking the response, and the
//! [`RevalidationConsumer`] later replays the request against the origin with
//! the preview credential so the render pipeline regenerates the artifact.

pub mod consumer;
pub mod dispatcher;
pub mod memory;
pub mod partition;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use consumer::{HttpRevalidator, RevalidationConsumer, Revalidator};
pub use dispatcher::RevalidationDispatcher;
pub use memory::MemoryQueue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevalidationMessage {
    pub host: String,
    /// Base-path-prefixed path to replay.
    pub url: String,
    /// Partition that orders messages for the same path.
    pub group_key: String,
    pub deduplication_id: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("revalidation queue is full ({limit} pending)")]
    Full { limit: usize },
    #[error("revalidation request to `{url}` failed: {message}")]
    Delivery { url: String, message: String },
}

impl QueueError {
    pub fn delivery(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            url: url.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn send(&self, message: RevalidationMessage) -> Result<(), QueueError>;
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serializes_camel_case() {
        let message = RevalidationMessage {
            host: "example.com".into(),
            url: "/albums".into(),
            group_key: "revalidate-3".into(),
            deduplication_id: "abc".into(),
        };
        let json = serde_json::to_value(&message).expect("serializes");
        assert_eq!(json["groupKey"], "revalidate-3");
        assert_eq!(json["deduplicationId"], "abc");
    }
}
