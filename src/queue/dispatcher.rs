use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use super::{Queue, RevalidationMessage, partition::group_key};

pub(crate) const METRIC_ENQUEUED: &str = "isrgate_revalidation_enqueued_total";
pub(crate) const METRIC_FAILED: &str = "isrgate_revalidation_failed_total";

/// Submits revalidation messages as detached tasks.
///
/// Delivery is best effort: nothing reports back to the request, and a
/// failed send is logged and dropped. The next stale read retries.
#[derive(Clone)]
pub struct RevalidationDispatcher {
    queue: Arc<dyn Queue>,
    max_concurrency: u32,
}

impl RevalidationDispatcher {
    pub fn new(queue: Arc<dyn Queue>, max_concurrency: u32) -> Self {
        Self {
            queue,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    /// Build the message for `url`; the group key hashes the cache path.
    pub fn message(
        &self,
        path: &str,
        url: impl Into<String>,
        host: impl Into<String>,
        deduplication_id: impl Into<String>,
    ) -> RevalidationMessage {
        RevalidationMessage {
            host: host.into(),
            url: url.into(),
            group_key: group_key(path, self.max_concurrency),
            deduplication_id: deduplication_id.into(),
        }
    }

    /// Fire and forget.
    pub fn enqueue(&self, message: RevalidationMessage) {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            deliver(queue.as_ref(), message).await;
        });
    }
}

async fn deliver(queue: &dyn Queue, message: RevalidationMessage) {
    let url = message.url.clone();
    let group = message.group_key.clone();
    match queue.send(message).await {
        Ok(()) => {
            counter!(METRIC_ENQUEUED).increment(1);
            debug!(url = %url, group = %group, queue = queue.name(), "Revalidation enqueued");
        }
        Err(err) => {
            counter!(METRIC_FAILED).increment(1);
            warn!(url = %url, group = %group, error = %err, "Failed to enqueue revalidation");
        }
    }
}
