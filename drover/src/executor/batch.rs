use super::archiver::BatchArchiver;
use super::controller::ExecutionController;
use super::error::Result;
use super::execution::ExecutorFactory;
use super::poller::Poller;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One poll-and-dispatch cycle of a worker, plus the drain at shutdown.
#[async_trait]
pub trait BatchProcessing: Send + Sync + 'static {
    /// Polls once and starts an execution per item. Returns how many were
    /// started.
    async fn process_batch(&self) -> Result<usize>;

    /// Waits for every started execution, then flushes pending archives.
    async fn await_completion(&self) -> Result<()>;
}

/// Pause after a failed poll unless set with
/// [`BatchProcessor::with_poll_backoff`].
const DEFAULT_POLL_BACKOFF: Duration = Duration::from_millis(200);

/// Feeds polled items into an [`ExecutionController`].
///
/// A failed poll is followed by a pause so a broken store is not hammered
/// in a tight loop.
pub struct BatchProcessor<P, F>
where
    P: Poller,
    F: ExecutorFactory<Item = P::Item>,
{
    poller: P,
    controller: ExecutionController<F>,
    archiver: Option<BatchArchiver>,
    poll_backoff: Duration,
    shutdown: CancellationToken,
}

impl<P, F> BatchProcessor<P, F>
where
    P: Poller,
    F: ExecutorFactory<Item = P::Item>,
{
    pub fn new(poller: P, controller: ExecutionController<F>, shutdown: CancellationToken) -> Self {
        Self {
            poller,
            controller,
            archiver: None,
            poll_backoff: DEFAULT_POLL_BACKOFF,
            shutdown,
        }
    }

    /// How long to wait after a failed poll before returning.
    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Flushes `archiver` once the controller has drained.
    pub fn with_archiver(mut self, archiver: BatchArchiver) -> Self {
        self.archiver = Some(archiver);
        self
    }
}

#[async_trait]
impl<P, F> BatchProcessing for BatchProcessor<P, F>
where
    P: Poller,
    F: ExecutorFactory<Item = P::Item>,
{
    async fn process_batch(&self) -> Result<usize> {
        let items = match self.poller.poll().await {
            Ok(items) => items,
            Err(e) => {
                warn!(
                    error = %e,
                    backoff_ms = self.poll_backoff.as_millis() as u64,
                    "poll failed; backing off"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.poll_backoff) => {}
                }
                return Ok(0);
            }
        };
        if items.is_empty() {
            return Ok(0);
        }
        // Leases taken just before shutdown expire and are redelivered
        if self.shutdown.is_cancelled() {
            debug!(count = items.len(), "shutdown requested; dropping polled batch");
            return Ok(0);
        }

        let count = items.len();
        for item in items {
            self.controller.start(item).await?;
        }
        debug!(count, "batch dispatched");
        Ok(count)
    }

    async fn await_completion(&self) -> Result<()> {
        self.controller.await_completion().await;
        if let Some(archiver) = &self.archiver {
            if let Err(e) = archiver.flush().await {
                warn!(error = %e, "failed to flush archived messages");
                return Err(e.into());
            }
        }
        Ok(())
    }
}
