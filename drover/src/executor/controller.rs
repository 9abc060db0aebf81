use super::error::{ExecutionError, Result};
use super::execution::{ExecutionOutcome, ExecutorFactory, TaskExecutor};
use crate::storage::LeasedItem;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info_span, Instrument};

/// Bounds how many executions run at once.
///
/// [`start`](Self::start) waits for a free slot, so callers are admitted in
/// the order they ask. Every execution is tracked; [`await_completion`]
/// waits for all of them and closes the controller to new work.
///
/// [`await_completion`]: Self::await_completion
pub struct ExecutionController<F: ExecutorFactory> {
    factory: F,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl<F: ExecutorFactory> ExecutionController<F> {
    pub fn new(factory: F, max_concurrent: usize, shutdown: CancellationToken) -> Self {
        Self {
            factory,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Starts executing `item` once a slot is free.
    ///
    /// Returns after the execution has been spawned, not after it finishes.
    /// Executor errors are logged here and also reach the returned handle.
    pub async fn start(
        &self,
        item: F::Item,
    ) -> Result<JoinHandle<Result<ExecutionOutcome>>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::ControllerClosed)?;

        let msg_id = item.msg_id();
        let read_count = item.read_count();
        let executor = self.factory.create(item, self.shutdown.clone());
        let span = info_span!("execution", msg_id, read_count);

        let handle = self.tracker.spawn(
            async move {
                let _permit = permit;
                let result = executor.execute().await;
                match &result {
                    Ok(outcome) => debug!(outcome = outcome.as_str(), "execution finished"),
                    Err(e) => error!(error = %e, "execution failed to settle"),
                }
                result
            }
            .instrument(span),
        );
        Ok(handle)
    }

    /// Number of executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stops admitting work and waits for every started execution.
    pub async fn await_completion(&self) {
        self.permits.close();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MessageRecord;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Probe {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<i64>>>,
    }

    struct SleepExecutor {
        msg_id: i64,
        probe: Probe,
    }

    #[async_trait]
    impl TaskExecutor for SleepExecutor {
        async fn execute(self) -> Result<ExecutionOutcome> {
            self.probe.order.lock().unwrap().push(self.msg_id);
            let now = self.probe.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.probe.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecutionOutcome::Completed)
        }
    }

    struct SleepFactory(Probe);

    impl ExecutorFactory for SleepFactory {
        type Item = MessageRecord;
        type Executor = SleepExecutor;

        fn create(&self, item: MessageRecord, _shutdown: CancellationToken) -> SleepExecutor {
            SleepExecutor {
                msg_id: item.msg_id,
                probe: self.0.clone(),
            }
        }
    }

    fn record(msg_id: i64) -> MessageRecord {
        MessageRecord {
            msg_id,
            read_ct: 1,
            enqueued_at: Utc::now(),
            vt: Utc::now(),
            message: json!(null),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded_and_fifo() {
        let probe = Probe::default();
        let controller = ExecutionController::new(SleepFactory(probe.clone()), 2, CancellationToken::new());

        for id in 1..=5 {
            controller.start(record(id)).await.unwrap();
        }
        controller.await_completion().await;

        assert_eq!(probe.peak.load(Ordering::SeqCst), 2);
        assert_eq!(*probe.order.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_controller_rejects_work() {
        let controller = ExecutionController::new(SleepFactory(Probe::default()), 1, CancellationToken::new());
        controller.await_completion().await;
        assert!(matches!(
            controller.start(record(1)).await,
            Err(ExecutionError::ControllerClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_carries_outcome() {
        let controller = ExecutionController::new(SleepFactory(Probe::default()), 1, CancellationToken::new());
        let handle = controller.start(record(7)).await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), ExecutionOutcome::Completed);
    }
}
