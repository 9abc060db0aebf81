use super::archiver::BatchArchiver;
use super::batch::BatchProcessor;
use super::controller::ExecutionController;
use super::error::Result;
use super::lifecycle::WorkerLifecycle;
use super::message::{boxed_message_handler, MessageExecutorFactory};
use super::poller::MessagePoller;
use super::worker::Worker;
use crate::config::QueueWorkerConfig;
use crate::core::{BoxError, MessageContext};
use crate::storage::Store;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builds a worker that runs `handler` for every message on the configured
/// queue.
///
/// Successful messages are archived in batches; failed ones are retried per
/// `config.retry` and archived once retries run out. The worker is returned
/// in `Created`; call [`Worker::start`] to run it.
///
/// ```no_run
/// use drover::config::QueueWorkerConfig;
/// use drover::core::{BoxError, MessageContext};
/// use drover::executor::create_queue_worker;
/// use drover::storage::InMemoryStore;
/// use serde::Deserialize;
/// use std::sync::Arc;
///
/// #[derive(Deserialize)]
/// struct Email {
///     to: String,
/// }
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(InMemoryStore::new());
/// let worker = create_queue_worker(
///     |email: Email, _ctx: MessageContext| async move {
///         println!("sending to {}", email.to);
///         Ok::<_, BoxError>(())
///     },
///     QueueWorkerConfig::default(),
///     store,
/// )?;
/// worker.start().await?;
/// # Ok(())
/// # }
/// ```
pub fn create_queue_worker<T, F, Fut, O, E>(
    handler: F,
    config: QueueWorkerConfig,
    store: Arc<dyn Store>,
) -> Result<Worker>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<O, E>> + Send + 'static,
    O: Send + 'static,
    E: Into<BoxError>,
{
    config.validate()?;
    let queue_name = config.queue_name().to_string();
    let shutdown = CancellationToken::new();

    let archiver = BatchArchiver::new(
        Arc::clone(&store),
        &queue_name,
        config.archive_batch_size,
        config.archive_timeout(),
    );
    let factory = MessageExecutorFactory::new(
        &queue_name,
        boxed_message_handler(handler),
        Arc::clone(&store),
        archiver.clone(),
        config.retry,
    );
    let controller = ExecutionController::new(factory, config.worker.max_concurrent, shutdown.clone());
    let poller = MessagePoller::new(
        Arc::clone(&store),
        &queue_name,
        config.worker.poll_params(),
        shutdown.clone(),
    );
    let processor = BatchProcessor::new(poller, controller, shutdown.clone())
        .with_archiver(archiver)
        .with_poll_backoff(config.worker.poll_interval());

    let lifecycle = WorkerLifecycle::new(
        Arc::clone(&store),
        &queue_name,
        config.worker.heartbeat_interval(),
    );
    Ok(Worker::new(
        &config.worker.function_name,
        lifecycle,
        Arc::new(processor),
        config.worker.close_store_on_stop.then_some(store),
        shutdown,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, WorkerConfig};
    use crate::executor::{ExecutionError, WorkerState};
    use crate::storage::InMemoryStore;
    use serde_json::Value;

    #[test]
    fn test_invalid_config_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let config = QueueWorkerConfig::default().with_worker(WorkerConfig::default().with_batch_size(0));
        let result = create_queue_worker(
            |_: Value, _ctx: MessageContext| async { Ok::<_, BoxError>(()) },
            config,
            store,
        );
        assert!(matches!(
            result,
            Err(ExecutionError::Config(ConfigError::Zero { field: "batch_size" }))
        ));
    }

    #[test]
    fn test_worker_defaults_to_tasks_queue() {
        let store = Arc::new(InMemoryStore::new());
        let worker = create_queue_worker(
            |_: Value, _ctx: MessageContext| async { Ok::<_, BoxError>(()) },
            QueueWorkerConfig::default(),
            store,
        )
        .unwrap();
        assert_eq!(worker.queue_name(), "tasks");
        assert_eq!(worker.state(), WorkerState::Created);
    }
}
