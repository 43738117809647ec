//! In-process revalidation queue.
//!
//! FIFO overall, which keeps every group in send order. A message whose
//! deduplication id is still pending is dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use metrics::gauge;
use tracing::{debug, warn};

use super::{Queue, QueueError, RevalidationMessage};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "queue::memory";
pub(crate) const METRIC_QUEUE_LEN: &str = "isrgate_revalidation_queue_len";

#[derive(Default)]
struct Pending {
    messages: VecDeque<RevalidationMessage>,
    ids: HashSet<String>,
}

pub struct MemoryQueue {
    pending: Mutex<Pending>,
    limit: usize,
}

impl MemoryQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            limit,
        }
    }

    /// Take up to `limit` messages in send order.
    pub fn drain(&self, limit: usize) -> Vec<RevalidationMessage> {
        let mut pending = mutex_lock(&self.pending, SOURCE, "drain");
        let count = limit.min(pending.messages.len());
        let drained: Vec<RevalidationMessage> = pending.messages.drain(..count).collect();
        for message in &drained {
            pending.ids.remove(&message.deduplication_id);
        }
        gauge!(METRIC_QUEUE_LEN).set(pending.messages.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.pending, SOURCE, "len").messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn send(&self, message: RevalidationMessage) -> Result<(), QueueError> {
        let mut pending = mutex_lock(&self.pending, SOURCE, "send");
        if pending.ids.contains(&message.deduplication_id) {
            debug!(
                url = %message.url,
                deduplication_id = %message.deduplication_id,
                "Duplicate revalidation suppressed"
            );
            return Ok(());
        }
        if pending.messages.len() >= self.limit {
            warn!(limit = self.limit, url = %message.url, "Revalidation queue full");
            return Err(QueueError::Full { limit: self.limit });
        }

        pending.ids.insert(message.deduplication_id.clone());
        pending.messages.push_back(message);
        gauge!(METRIC_QUEUE_LEN).set(pending.messages.len() as f64);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
