use super::error::Result;
use super::execution::{run_handler, ExecutionOutcome, ExecutorFactory, HandlerRun, TaskExecutor};
use crate::core::{error_message, BoxError, RetryConfig, StepContext};
use crate::graph::Flow;
use crate::storage::{LeasedItem, StepTaskRecord, Store};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Executes one step task of a flow run.
///
/// Retries follow the step's effective `max_attempts` and `base_delay`:
/// a failed task is made visible again after an exponential backoff until
/// its attempts run out, then the task (and with it the run) is failed.
pub struct StepTaskExecutor {
    task: StepTaskRecord,
    flow: Arc<Flow>,
    store: Arc<dyn Store>,
    queue_name: String,
    shutdown: CancellationToken,
}

#[async_trait]
impl TaskExecutor for StepTaskExecutor {
    async fn execute(self) -> Result<ExecutionOutcome> {
        let task = &self.task;
        let attempt = task.read_count();

        // An unknown step fails like a handler would, so the run does not
        // hang on a task no worker can execute.
        let step = match self.flow.get_step_definition(&task.step_slug) {
            Ok(step) => Arc::clone(step),
            Err(e) => return self.settle_failure(Box::new(e), None).await,
        };

        let ctx = StepContext::new(
            self.flow.slug().as_str(),
            task.run_id,
            &task.step_slug,
            attempt,
            self.shutdown.clone(),
        );
        let input = task.input.clone();
        let invocation = {
            let step = Arc::clone(&step);
            async move { step.invoke(input, ctx).await }
        };

        match run_handler(invocation, &self.shutdown).await {
            HandlerRun::Aborted => {
                debug!(
                    run_id = %task.run_id,
                    step = %task.step_slug,
                    "shutdown began; leaving task for redelivery"
                );
                Ok(ExecutionOutcome::AbortedForRedelivery)
            }
            HandlerRun::Finished(Ok(output)) => {
                self.store
                    .complete_task(task.run_id, &task.step_slug, &output)
                    .await?;
                debug!(run_id = %task.run_id, step = %task.step_slug, "step completed");
                Ok(ExecutionOutcome::Completed)
            }
            HandlerRun::Finished(Err(e)) => {
                let retry = self.flow.retry_config(&step);
                self.settle_failure(e, Some(retry)).await
            }
        }
    }
}

impl StepTaskExecutor {
    async fn settle_failure(
        &self,
        error: BoxError,
        retry: Option<RetryConfig>,
    ) -> Result<ExecutionOutcome> {
        let task = &self.task;
        let attempt = task.read_count();
        let error = error_message(error.as_ref());

        match retry {
            Some(retry) if retry.should_retry(attempt) => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    run_id = %task.run_id,
                    step = %task.step_slug,
                    attempt,
                    delay_secs = delay.as_secs(),
                    %error,
                    "step failed; retrying"
                );
                self.store
                    .set_visibility(&self.queue_name, task.msg_id, delay)
                    .await?;
                Ok(ExecutionOutcome::Retrying { delay })
            }
            _ => {
                error!(
                    run_id = %task.run_id,
                    step = %task.step_slug,
                    attempt,
                    %error,
                    "step failed permanently"
                );
                self.store
                    .fail_task(task.run_id, &task.step_slug, &error)
                    .await?;
                Ok(ExecutionOutcome::PermanentlyFailed { error })
            }
        }
    }
}

/// Builds a [`StepTaskExecutor`] per leased task.
pub struct StepTaskExecutorFactory {
    flow: Arc<Flow>,
    store: Arc<dyn Store>,
    queue_name: String,
}

impl StepTaskExecutorFactory {
    pub fn new(flow: Arc<Flow>, store: Arc<dyn Store>, queue_name: impl Into<String>) -> Self {
        Self {
            flow,
            store,
            queue_name: queue_name.into(),
        }
    }
}

impl ExecutorFactory for StepTaskExecutorFactory {
    type Item = StepTaskRecord;
    type Executor = StepTaskExecutor;

    fn create(&self, task: StepTaskRecord, shutdown: CancellationToken) -> StepTaskExecutor {
        StepTaskExecutor {
            task,
            flow: Arc::clone(&self.flow),
            store: Arc::clone(&self.store),
            queue_name: self.queue_name.clone(),
            shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{StepOptions, StepPayload};
    use crate::storage::{InMemoryStore, PollParams, RunStatus, StepStatus, StoreOp};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn params() -> PollParams {
        PollParams {
            batch_size: 10,
            visibility_timeout: Duration::from_secs(2),
            max_poll: Duration::ZERO,
            poll_interval: Duration::from_millis(100),
        }
    }

    fn flow() -> Flow {
        Flow::new("greet")
            .unwrap()
            .step("name", |input: StepPayload, _ctx: StepContext| async move {
                Ok::<_, BoxError>(input.run_value()["name"].clone())
            })
            .unwrap()
            .step(
                StepOptions::new("shout").depends_on(["name"]).max_attempts(2).base_delay(4),
                |input: StepPayload, _ctx: StepContext| async move {
                    let name: String = input.dep("name")?;
                    if name.is_empty() {
                        return Err::<Value, BoxError>("empty name".into());
                    }
                    Ok(json!(name.to_uppercase()))
                },
            )
            .unwrap()
    }

    async fn run_one(store: &Arc<InMemoryStore>, factory: &StepTaskExecutorFactory) -> ExecutionOutcome {
        let mut tasks = store.poll_for_tasks("greet", params()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        factory
            .create(tasks.remove(0), CancellationToken::new())
            .execute()
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_complete_the_run() {
        let flow = Arc::new(flow());
        let store = Arc::new(InMemoryStore::new());
        store.register_flow(&flow);
        let factory = StepTaskExecutorFactory::new(flow, store.clone(), "greet");
        let run_id = store.start_flow("greet", json!({"name": "ada"})).unwrap();

        assert_eq!(run_one(&store, &factory).await, ExecutionOutcome::Completed);
        assert_eq!(run_one(&store, &factory).await, ExecutionOutcome::Completed);

        let run = store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!({"shout": "ADA"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_step_retries_then_fails_run() {
        let flow = Arc::new(flow());
        let store = Arc::new(InMemoryStore::new());
        store.register_flow(&flow);
        let factory = StepTaskExecutorFactory::new(flow, store.clone(), "greet");
        let run_id = store.start_flow("greet", json!({"name": ""})).unwrap();

        assert_eq!(run_one(&store, &factory).await, ExecutionOutcome::Completed);
        assert_eq!(
            run_one(&store, &factory).await,
            ExecutionOutcome::Retrying {
                delay: Duration::from_secs(4)
            }
        );

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            run_one(&store, &factory).await,
            ExecutionOutcome::PermanentlyFailed {
                error: "empty name".to_string()
            }
        );

        let run = store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let step = &run.steps["shout"];
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempts_count, 2);
        assert_eq!(step.error_message.as_deref(), Some("empty name"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_step_fails_task() {
        let full = flow();
        let store = Arc::new(InMemoryStore::new());
        store.register_flow(&full);
        let partial = Flow::new("greet").unwrap();
        let factory = StepTaskExecutorFactory::new(Arc::new(partial), store.clone(), "greet");
        let run_id = store.start_flow("greet", json!({"name": "ada"})).unwrap();

        assert!(matches!(
            run_one(&store, &factory).await,
            ExecutionOutcome::PermanentlyFailed { .. }
        ));
        assert_eq!(store.run(run_id).unwrap().status, RunStatus::Failed);
        assert_eq!(store.call_count(StoreOp::FailTask), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_leaves_task_leased() {
        let flow = Arc::new(flow());
        let store = Arc::new(InMemoryStore::new());
        store.register_flow(&flow);
        let factory = StepTaskExecutorFactory::new(flow, store.clone(), "greet");
        let run_id = store.start_flow("greet", json!({"name": "ada"})).unwrap();

        let mut tasks = store.poll_for_tasks("greet", params()).await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let outcome = factory.create(tasks.remove(0), shutdown).execute().await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::AbortedForRedelivery);

        assert_eq!(store.call_count(StoreOp::CompleteTask), 0);
        assert_eq!(store.call_count(StoreOp::FailTask), 0);
        assert_eq!(store.call_count(StoreOp::SetVisibility), 0);
        assert_eq!(store.run(run_id).unwrap().status, RunStatus::Started);
    }
}
