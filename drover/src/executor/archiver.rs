use crate::storage::{Result, Store};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Archives successfully processed messages in batches.
///
/// Ids are collected until `batch_size` of them are pending, or until
/// `timeout` has passed since the first id of the current batch arrived,
/// whichever comes first. Ids stay pending until a batch archive succeeds,
/// so a store failure only delays them.
#[derive(Clone)]
pub struct BatchArchiver {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    queue_name: String,
    batch_size: usize,
    timeout: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pending: BTreeSet<i64>,
    timer: Option<JoinHandle<()>>,
}

impl BatchArchiver {
    pub fn new(
        store: Arc<dyn Store>,
        queue_name: impl Into<String>,
        batch_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                queue_name: queue_name.into(),
                batch_size: batch_size.max(1),
                timeout,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub async fn add(&self, msg_id: i64) {
        let mut state = self.inner.state.lock().await;
        state.pending.insert(msg_id);

        if state.pending.len() >= self.inner.batch_size {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if let Err(e) = self.inner.archive_pending(&mut state).await {
                warn!(queue = %self.inner.queue_name, error = %e, "batch archive failed");
            }
        } else if state.timer.is_none() {
            let inner = Arc::clone(&self.inner);
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.timeout).await;
                let mut state = inner.state.lock().await;
                state.timer = None;
                if let Err(e) = inner.archive_pending(&mut state).await {
                    warn!(queue = %inner.queue_name, error = %e, "timed batch archive failed");
                }
            }));
        }
    }

    /// Archives everything still pending.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        self.inner.archive_pending(&mut state).await
    }

    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }
}

impl Inner {
    async fn archive_pending(&self, state: &mut State) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = state.pending.iter().copied().collect();
        self.store.archive_batch(&self.queue_name, &ids).await?;
        for id in &ids {
            state.pending.remove(id);
        }
        debug!(queue = %self.queue_name, count = ids.len(), "archived batch");
        Ok(())
    }
}
