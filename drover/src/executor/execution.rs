//! The contract between the batch machinery and a single execution.
//!
//! A [`TaskExecutor`] runs one handler invocation for one leased item and
//! settles the item against the store. An [`ExecutorFactory`] builds one per
//! polled item. Handler failures are settled, not returned: the only errors
//! an executor returns are store faults hit while settling.

use super::error::Result;
use crate::core::BoxError;
use crate::storage::LeasedItem;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How one execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The handler succeeded and the item was settled as done.
    Completed,
    /// The handler failed; the item becomes visible again after `delay`.
    Retrying { delay: Duration },
    /// The handler failed with no retries left; the item was archived or
    /// its task failed.
    PermanentlyFailed { error: String },
    /// Shutdown began before or during the handler. Nothing was reported;
    /// the item is redelivered once its lease expires.
    AbortedForRedelivery,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::Retrying { .. } => "retrying",
            ExecutionOutcome::PermanentlyFailed { .. } => "permanently_failed",
            ExecutionOutcome::AbortedForRedelivery => "aborted_for_redelivery",
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + 'static {
    /// Runs the handler once and settles the item.
    async fn execute(self) -> Result<ExecutionOutcome>;
}

pub trait ExecutorFactory: Send + Sync + 'static {
    type Item: LeasedItem;
    type Executor: TaskExecutor;

    fn create(&self, item: Self::Item, shutdown: CancellationToken) -> Self::Executor;
}

/// Result of racing a handler against shutdown.
pub(crate) enum HandlerRun {
    Finished(std::result::Result<Value, BoxError>),
    Aborted,
}

/// Runs `handler` on its own task until it finishes or `shutdown` fires.
///
/// The handler is never started once shutdown has begun. When shutdown wins
/// the race the handler task is left to run detached; a handler that
/// already finished is reported even if shutdown fired at the same time. A
/// panicking handler counts as a failure.
pub(crate) async fn run_handler<F>(handler: F, shutdown: &CancellationToken) -> HandlerRun
where
    F: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
{
    if shutdown.is_cancelled() {
        return HandlerRun::Aborted;
    }

    let handle = tokio::spawn(handler);
    tokio::select! {
        biased;
        joined = handle => match joined {
            Ok(result) => HandlerRun::Finished(result),
            Err(e) if e.is_panic() => {
                HandlerRun::Finished(Err(panic_message(e.into_panic()).into()))
            }
            Err(e) => HandlerRun::Finished(Err(Box::new(e))),
        },
        _ = shutdown.cancelled() => HandlerRun::Aborted,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
