use super::archiver::BatchArchiver;
use super::error::Result;
use super::execution::{run_handler, ExecutionOutcome, ExecutorFactory, HandlerRun, TaskExecutor};
use crate::core::{error_message, BoxError, MessageContext, RetryConfig};
use crate::storage::{LeasedItem, MessageRecord, Store};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type MessageFuture = BoxFuture<'static, std::result::Result<Value, BoxError>>;

/// A queue handler with its payload type erased.
pub type BoxedMessageHandler = Arc<dyn Fn(Value, MessageContext) -> MessageFuture + Send + Sync>;

/// Erases the payload type of a queue handler.
///
/// The message is decoded into `T` before the handler runs; a payload that
/// does not decode is a handler failure and is retried like one. Whatever
/// the handler returns on success is discarded.
pub fn boxed_message_handler<T, F, Fut, O, E>(handler: F) -> BoxedMessageHandler
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<O, E>> + Send + 'static,
    O: Send + 'static,
    E: Into<BoxError>,
{
    let handler = Arc::new(handler);
    Arc::new(move |payload: Value, ctx: MessageContext| {
        let handler = Arc::clone(&handler);
        async move {
            let payload: T = serde_json::from_value(payload)?;
            handler(payload, ctx).await.map_err(Into::into)?;
            Ok::<Value, BoxError>(Value::Null)
        }
        .boxed()
    })
}

/// Executes one queue message.
pub struct MessageExecutor {
    record: MessageRecord,
    queue_name: String,
    handler: BoxedMessageHandler,
    store: Arc<dyn Store>,
    archiver: BatchArchiver,
    retry: RetryConfig,
    shutdown: CancellationToken,
}

#[async_trait]
impl TaskExecutor for MessageExecutor {
    async fn execute(self) -> Result<ExecutionOutcome> {
        let msg_id = self.record.msg_id;
        let read_count = self.record.read_count();
        let ctx = MessageContext::new(&self.queue_name, msg_id, read_count, self.shutdown.clone());
        let handler = (self.handler)(self.record.message.clone(), ctx);

        match run_handler(handler, &self.shutdown).await {
            HandlerRun::Aborted => {
                debug!(msg_id, "shutdown began; leaving message for redelivery");
                Ok(ExecutionOutcome::AbortedForRedelivery)
            }
            HandlerRun::Finished(Ok(_)) => {
                self.archiver.add(msg_id).await;
                Ok(ExecutionOutcome::Completed)
            }
            HandlerRun::Finished(Err(e)) => {
                let error = error_message(e.as_ref());
                if self.retry.should_retry(read_count) {
                    let delay = self.retry.delay_for_attempt(read_count);
                    warn!(msg_id, read_count, delay_secs = delay.as_secs(), %error, "message failed; retrying");
                    self.store
                        .set_visibility(&self.queue_name, msg_id, delay)
                        .await?;
                    Ok(ExecutionOutcome::Retrying { delay })
                } else {
                    warn!(msg_id, read_count, %error, "message failed permanently; archiving");
                    self.store.archive(&self.queue_name, msg_id).await?;
                    Ok(ExecutionOutcome::PermanentlyFailed { error })
                }
            }
        }
    }
}

/// Builds a [`MessageExecutor`] per leased message.
pub struct MessageExecutorFactory {
    queue_name: String,
    handler: BoxedMessageHandler,
    store: Arc<dyn Store>,
    archiver: BatchArchiver,
    retry: RetryConfig,
}

impl MessageExecutorFactory {
    pub fn new(
        queue_name: impl Into<String>,
        handler: BoxedMessageHandler,
        store: Arc<dyn Store>,
        archiver: BatchArchiver,
        retry: RetryConfig,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            handler,
            store,
            archiver,
            retry,
        }
    }
}

impl ExecutorFactory for MessageExecutorFactory {
    type Item = MessageRecord;
    type Executor = MessageExecutor;

    fn create(&self, record: MessageRecord, shutdown: CancellationToken) -> MessageExecutor {
        MessageExecutor {
            record,
            queue_name: self.queue_name.clone(),
            handler: Arc::clone(&self.handler),
            store: Arc::clone(&self.store),
            archiver: self.archiver.clone(),
            retry: self.retry,
            shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStore, PollParams, StoreOp};
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Email {
        to: String,
    }

    fn factory(store: &Arc<InMemoryStore>, handler: BoxedMessageHandler, retry: RetryConfig) -> MessageExecutorFactory {
        let archiver = BatchArchiver::new(store.clone(), "q", 1, Duration::from_millis(500));
        MessageExecutorFactory::new("q", handler, store.clone(), archiver, retry)
    }

    async fn lease(store: &InMemoryStore) -> MessageRecord {
        let params = PollParams {
            batch_size: 1,
            visibility_timeout: Duration::from_secs(10),
            max_poll: Duration::ZERO,
            poll_interval: Duration::from_millis(100),
        };
        store.read_with_poll("q", params).await.unwrap().remove(0)
    }

    fn failing() -> BoxedMessageHandler {
        boxed_message_handler(|_: Value, _ctx: MessageContext| async { Err::<(), _>("nope") })
    }

    #[tokio::test]
    async fn test_success_hands_message_to_archiver() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.send("q", json!({"to": "a@example.com"}));
        let handler = boxed_message_handler(|email: Email, _ctx: MessageContext| async move {
            assert_eq!(email.to, "a@example.com");
            Ok::<_, BoxError>(())
        });

        let executor = factory(&store, handler, RetryConfig::default()).create(lease(&store).await, CancellationToken::new());
        assert_eq!(executor.execute().await.unwrap(), ExecutionOutcome::Completed);
        assert_eq!(store.archived_ids("q"), vec![id]);
        assert_eq!(store.call_count(StoreOp::ArchiveBatch), 1);
    }

    #[tokio::test]
    async fn test_failure_with_retries_left_extends_lease() {
        let store = Arc::new(InMemoryStore::new());
        store.send("q", json!({}));
        let executor = factory(&store, failing(), RetryConfig::fixed(2, 7))
            .create(lease(&store).await, CancellationToken::new());
        assert_eq!(
            executor.execute().await.unwrap(),
            ExecutionOutcome::Retrying {
                delay: Duration::from_secs(7)
            }
        );
        assert_eq!(store.call_count(StoreOp::SetVisibility), 1);
        assert_eq!(store.queue_len("q"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_archive() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.send("q", json!({}));
        let executor = factory(&store, failing(), RetryConfig::NONE)
            .create(lease(&store).await, CancellationToken::new());
        assert_eq!(
            executor.execute().await.unwrap(),
            ExecutionOutcome::PermanentlyFailed {
                error: "nope".to_string()
            }
        );
        assert_eq!(store.archived_ids("q"), vec![id]);
        assert_eq!(store.call_count(StoreOp::SetVisibility), 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_a_failure() {
        let store = Arc::new(InMemoryStore::new());
        store.send("q", json!("not an email"));
        let handler = boxed_message_handler(|_: Email, _ctx: MessageContext| async { Ok::<_, BoxError>(()) });
        let executor = factory(&store, handler, RetryConfig::NONE)
            .create(lease(&store).await, CancellationToken::new());
        assert!(matches!(
            executor.execute().await.unwrap(),
            ExecutionOutcome::PermanentlyFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_abort_reports_nothing() {
        let store = Arc::new(InMemoryStore::new());
        store.send("q", json!({}));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let executor = factory(&store, failing(), RetryConfig::default())
            .create(lease(&store).await, shutdown);
        assert_eq!(
            executor.execute().await.unwrap(),
            ExecutionOutcome::AbortedForRedelivery
        );
        assert_eq!(store.call_count(StoreOp::SetVisibility), 0);
        assert_eq!(store.call_count(StoreOp::Archive), 0);
        assert_eq!(store.queue_len("q"), 1);
    }

    #[tokio::test]
    async fn test_settlement_failure_propagates() {
        let store = Arc::new(InMemoryStore::new());
        store.send("q", json!({}));
        store.fail_on(StoreOp::SetVisibility);
        let executor = factory(&store, failing(), RetryConfig::default())
            .create(lease(&store).await, CancellationToken::new());
        assert!(executor.execute().await.is_err());
    }
}
