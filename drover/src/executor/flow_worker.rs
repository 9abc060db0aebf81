use super::batch::BatchProcessor;
use super::controller::ExecutionController;
use super::error::Result;
use super::lifecycle::WorkerLifecycle;
use super::poller::StepTaskPoller;
use super::step_task::StepTaskExecutorFactory;
use super::worker::Worker;
use crate::config::FlowWorkerConfig;
use crate::graph::Flow;
use crate::storage::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builds a worker that executes the step tasks of `flow`.
///
/// Tasks are polled from `config.worker.queue_name`, or from the queue named
/// after the flow slug when none is set. Step retries follow each step's
/// `max_attempts` and `base_delay`.
pub fn create_flow_worker(
    flow: Flow,
    config: FlowWorkerConfig,
    store: Arc<dyn Store>,
) -> Result<Worker> {
    config.validate()?;
    let queue_name = config
        .worker
        .queue_name
        .clone()
        .unwrap_or_else(|| flow.slug().to_string());
    let shutdown = CancellationToken::new();

    let factory = StepTaskExecutorFactory::new(Arc::new(flow), Arc::clone(&store), &queue_name);
    let controller = ExecutionController::new(factory, config.worker.max_concurrent, shutdown.clone());
    let poller = StepTaskPoller::new(
        Arc::clone(&store),
        &queue_name,
        config.worker.poll_params(),
        shutdown.clone(),
    );
    let processor = BatchProcessor::new(poller, controller, shutdown.clone())
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
