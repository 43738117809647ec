//! Revalidation consumer.
//!
//! Drains the queue in batches. Groups run concurrently; messages inside a
//! group run one after another so a path is never regenerated out of order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use metrics::{counter, histogram};
use reqwest::{Client, Method, Url};
use tracing::{debug, info, instrument, warn};

use super::dispatcher::METRIC_FAILED;
use super::{MemoryQueue, QueueError, RevalidationMessage};

const METRIC_CONSUME_MS: &str = "isrgate_revalidation_consume_ms";

/// Header carrying the preview credential; a matching value bypasses the cache.
pub const REVALIDATE_HEADER: &str = "x-prerender-revalidate";
/// Marks the replayed request as ISR-eligible for the renderer.
pub const ISR_HEADER: &str = "x-isr";
const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

#[async_trait]
pub trait Revalidator: Send + Sync {
    async fn revalidate(&self, message: &RevalidationMessage) -> Result<(), QueueError>;
}

/// Replays the request with `HEAD` so the origin re-renders without a body.
///
/// Requests always go to the configured origin. The host the client asked for
/// travels as `x-forwarded-host` and never selects where the credential is sent.
pub struct HttpRevalidator {
    client: Client,
    origin: Url,
    preview_mode_id: String,
    timeout: Duration,
}

impl HttpRevalidator {
    pub fn new(
        client: Client,
        origin: Url,
        preview_mode_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            origin,
            preview_mode_id: preview_mode_id.into(),
            timeout,
        }
    }

    pub fn target(&self, url: &str) -> Result<Url, QueueError> {
        let target = self
            .origin
            .join(url)
            .map_err(|err| QueueError::delivery(url, err.to_string()))?;
        if target.origin() != self.origin.origin() {
            return Err(QueueError::delivery(url, "target leaves the configured origin"));
        }
        Ok(target)
    }
}

#[async_trait]
impl Revalidator for HttpRevalidator {
    async fn revalidate(&self, message: &RevalidationMessage) -> Result<(), QueueError> {
        let target = self.target(&message.url)?;
        let mut request = self
            .client
            .request(Method::HEAD, target.clone())
            .header(REVALIDATE_HEADER, &self.preview_mode_id)
            .header(ISR_HEADER, "1")
            .timeout(self.timeout);
        if !message.host.is_empty() {
            request = request.header(FORWARDED_HOST_HEADER, &message.host);
        }
        let response = request
            .send()
            .await
            .map_err(|err| QueueError::delivery(target.as_str(), err.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(QueueError::delivery(
                target.as_str(),
                format!("origin returned {status}"),
            ));
        }
        debug!(target = %target, status = status.as_u16(), "Revalidation request completed");
        Ok(())
    }
}

pub struct RevalidationConsumer {
    queue: Arc<MemoryQueue>,
    revalidator: Arc<dyn Revalidator>,
    batch_limit: usize,
}

impl RevalidationConsumer {
    pub fn new(
        queue: Arc<MemoryQueue>,
        revalidator: Arc<dyn Revalidator>,
        batch_limit: usize,
    ) -> Self {
        Self {
            queue,
            revalidator,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Process one batch. Returns the number of messages taken.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> usize {
        let started_at = Instant::now();
        let messages = self.queue.drain(self.batch_limit);
        if messages.is_empty() {
            return 0;
        }
        let count = messages.len();
        let groups = group_in_order(messages);

        info!(messages = count, groups = groups.len(), "Revalidation batch starting");

        let revalidator = self.revalidator.as_ref();
        let failures: usize = join_all(groups.into_iter().map(|(group, messages)| async move {
            let mut failed = 0;
            for message in &messages {
                if let Err(err) = revalidator.revalidate(message).await {
                    failed += 1;
                    counter!(METRIC_FAILED).increment(1);
                    warn!(group = %group, url = %message.url, error = %err, "Revalidation failed");
                }
            }
            failed
        }))
        .await
        .into_iter()
        .sum();

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_CONSUME_MS).record(elapsed_ms);
        info!(
            messages = count,
            failures,
            elapsed_ms,
            "Revalidation batch complete"
        );
        count
    }
}

/// Split messages by group key, keeping first-seen group order and send order within a group.
fn group_in_order(messages: Vec<RevalidationMessage>) -> Vec<(String, Vec<RevalidationMessage>)> {
    let mut groups: Vec<(String, Vec<RevalidationMessage>)> = Vec::new();
    for message in messages {
        match groups.iter_mut().find(|(key, _)| *key == message.group_key) {
            Some((_, bucket)) => bucket.push(message),
            None => groups.push((message.group_key.clone(), vec![message])),
        }
    }
    groups
}
