//! Contexts handed to user handlers alongside their payload.
//!
//! Both carry a cancellation token that fires when the owning worker begins
//! stopping. Handlers are never forcibly terminated; long-running handlers
//! should watch [`StepContext::cancelled`] and return early.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context for a single flow step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub flow_slug: String,
    pub run_id: Uuid,
    pub step_slug: String,
    /// Delivery attempt for this task, 1 on first delivery.
    pub attempt: u32,
    shutdown: CancellationToken,
}

impl StepContext {
    pub fn new(
        flow_slug: impl Into<String>,
        run_id: Uuid,
        step_slug: impl Into<String>,
        attempt: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            flow_slug: flow_slug.into(),
            run_id,
            step_slug: step_slug.into(),
            attempt,
            shutdown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Completes once the worker starts shutting down.
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Context for a single queue message execution.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub queue_name: String,
    pub msg_id: i64,
    pub read_count: u32,
    shutdown: CancellationToken,
}

impl MessageContext {
    pub fn new(
        queue_name: impl Into<String>,
        msg_id: i64,
        read_count: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            msg_id,
            read_count,
            shutdown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
