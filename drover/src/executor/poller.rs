use crate::storage::{self, LeasedItem, MessageRecord, PollParams, StepTaskRecord, Store};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Leases the next batch of work from a store.
///
/// A poll made or interrupted after shutdown returns an empty batch. Store
/// errors are passed through so the caller can back off.
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    type Item: LeasedItem;

    async fn poll(&self) -> storage::Result<Vec<Self::Item>>;
}

/// Polls a plain message queue.
pub struct MessagePoller {
    store: Arc<dyn Store>,
    queue_name: String,
    params: PollParams,
    shutdown: CancellationToken,
}

impl MessagePoller {
    pub fn new(
        store: Arc<dyn Store>,
        queue_name: impl Into<String>,
        params: PollParams,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
            params,
            shutdown,
        }
    }
}

#[async_trait]
impl Poller for MessagePoller {
    type Item = MessageRecord;

    async fn poll(&self) -> storage::Result<Vec<MessageRecord>> {
        if self.shutdown.is_cancelled() {
            debug!(queue = %self.queue_name, "shutdown requested; skipping poll");
            return Ok(Vec::new());
        }
        let messages = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(Vec::new()),
            result = self.store.read_with_poll(&self.queue_name, self.params) => result?,
        };
        debug!(queue = %self.queue_name, count = messages.len(), "polled messages");
        Ok(messages)
    }
}

/// Polls the step tasks of one flow.
pub struct StepTaskPoller {
    store: Arc<dyn Store>,
    queue_name: String,
    params: PollParams,
    shutdown: CancellationToken,
}

impl StepTaskPoller {
    pub fn new(
        store: Arc<dyn Store>,
        queue_name: impl Into<String>,
        params: PollParams,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
            params,
            shutdown,
        }
    }
}

#[async_trait]
impl Poller for StepTaskPoller {
    type Item = StepTaskRecord;

    async fn poll(&self) -> storage::Result<Vec<StepTaskRecord>> {
        if self.shutdown.is_cancelled() {
            debug!(queue = %self.queue_name, "shutdown requested; skipping poll");
            return Ok(Vec::new());
        }
        let tasks = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(Vec::new()),
            result = self.store.poll_for_tasks(&self.queue_name, self.params) => result?,
        };
        debug!(queue = %self.queue_name, count = tasks.len(), "polled step tasks");
        Ok(tasks)
    }
}
