use crate::storage::{HeartbeatStatus, Result, Store, WorkerRow};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Rate-limited liveness signal for one registered worker.
///
/// The first call always reaches the store; later calls are skipped until
/// `interval` has passed since the last successful send. A failed send is
/// retried on the next call.
pub struct Heartbeat {
    interval: Duration,
    store: Arc<dyn Store>,
    worker: WorkerRow,
    last_sent: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration, store: Arc<dyn Store>, worker: WorkerRow) -> Self {
        Self {
            interval,
            store,
            worker,
            last_sent: None,
        }
    }

    /// Sends a heartbeat if one is due.
    ///
    /// Returns `None` when the call was skipped, otherwise the store's
    /// answer.
    pub async fn send(&mut self) -> Result<Option<HeartbeatStatus>> {
        let now = Instant::now();
        if let Some(last) = self.last_sent {
            if now.duration_since(last) < self.interval {
                return Ok(None);
            }
        }

        let status = self.store.send_heartbeat(&self.worker).await?;
        self.last_sent = Some(now);
        debug!(
            worker_id = %self.worker.worker_id,
            is_deprecated = status.is_deprecated,
            "heartbeat sent"
        );
        Ok(Some(status))
    }

    pub fn worker(&self) -> &WorkerRow {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStore, StoreOp};
    use uuid::Uuid;

    async fn setup() -> (Arc<InMemoryStore>, Heartbeat) {
        let store = Arc::new(InMemoryStore::new());
        let row = store
            .register_worker("q", Uuid::new_v4(), "test")
            .await
            .unwrap();
        let heartbeat = Heartbeat::new(Duration::from_secs(5), store.clone(), row);
        (store, heartbeat)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_send_is_immediate() {
        let (store, mut heartbeat) = setup().await;
        let status = heartbeat.send().await.unwrap();
        assert_eq!(status, Some(HeartbeatStatus { is_deprecated: false }));
        assert_eq!(store.call_count(StoreOp::SendHeartbeat), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_are_rate_limited() {
        let (store, mut heartbeat) = setup().await;
        heartbeat.send().await.unwrap();

        tokio::time::advance(Duration::from_millis(4999)).await;
        assert_eq!(heartbeat.send().await.unwrap(), None);
        assert_eq!(store.call_count(StoreOp::SendHeartbeat), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(heartbeat.send().await.unwrap().is_some());
        assert_eq!(store.call_count(StoreOp::SendHeartbeat), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_retried_next_call() {
        let (store, mut heartbeat) = setup().await;
        store.fail_on(StoreOp::SendHeartbeat);
        assert!(heartbeat.send().await.is_err());

        store.recover(StoreOp::SendHeartbeat);
        assert!(heartbeat.send().await.unwrap().is_some());
        assert_eq!(store.call_count(StoreOp::SendHeartbeat), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_deprecation() {
        let (store, mut heartbeat) = setup().await;
        store.deprecate_workers("q");
        let status = heartbeat.send().await.unwrap().unwrap();
        assert!(status.is_deprecated);
    }
}
