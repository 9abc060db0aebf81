//! Storage layer for drover workers.
//!
//! This module provides a trait-based interface to the queue store a worker
//! leases work from, with two backend implementations:
//!
//! - [`InMemoryStore`]: in-process queues and flow runs for tests and development
//! - [`PostgresStore`]: pgmq queues plus the pgflow schema (`postgres` feature)
//!
//! # Example
//!
//! ```no_run
//! use drover::storage::{InMemoryStore, PollParams, Store};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! store.send("emails", serde_json::json!({"to": "a@example.com"}));
//!
//! let batch = store
//!     .read_with_poll("emails", PollParams {
//!         batch_size: 10,
//!         visibility_timeout: Duration::from_secs(10),
//!         max_poll: Duration::from_secs(5),
//!         poll_interval: Duration::from_millis(200),
//!     })
//!     .await?;
//! store.archive("emails", batch[0].msg_id).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

mod error;
mod params;
mod queue;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{Result, StorageError};
pub use memory::{InMemoryStore, RunSnapshot, StoreOp};
pub use params::PollParams;
pub use queue::{
    HeartbeatStatus, LeasedItem, MessageRecord, RunStatus, StepStatus, StepTaskRecord, WorkerRow,
};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Trait for queue store backends.
///
/// Worker bookkeeping is required of every backend. Queue and flow-task
/// operations are optional: a backend that only serves one kind of worker
/// leaves the other set at its default, which returns
/// [`StorageError::Unsupported`].
#[async_trait]
pub trait Store: Send + Sync {
    // ===== Worker Registry =====

    /// Record a worker as started for `queue_name`.
    async fn register_worker(
        &self,
        queue_name: &str,
        worker_id: Uuid,
        function_name: &str,
    ) -> Result<WorkerRow>;

    /// Bump the worker's heartbeat and report whether it has been deprecated.
    async fn send_heartbeat(&self, worker: &WorkerRow) -> Result<HeartbeatStatus>;

    /// Record the worker as stopped.
    async fn mark_worker_stopped(&self, worker_id: Uuid) -> Result<()>;

    /// Release connections held by the store.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    // ===== Message Queue Operations =====

    /// Lease up to `params.batch_size` visible messages, long-polling while
    /// the queue is empty.
    ///
    /// # Default Implementation
    ///
    /// Returns `StorageError::Unsupported` by default.
    async fn read_with_poll(&self, queue_name: &str, params: PollParams) -> Result<Vec<MessageRecord>> {
        let _ = (queue_name, params);
        Err(StorageError::Unsupported(
            "message queues not implemented for this storage backend".to_string(),
        ))
    }

    /// Make a leased message visible again `delay` from now.
    async fn set_visibility(&self, queue_name: &str, msg_id: i64, delay: Duration) -> Result<()> {
        let _ = (queue_name, msg_id, delay);
        Err(StorageError::Unsupported(
            "message queues not implemented for this storage backend".to_string(),
        ))
    }

    /// Remove a message from the queue, keeping it in the queue's archive.
    async fn archive(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        let _ = (queue_name, msg_id);
        Err(StorageError::Unsupported(
            "message queues not implemented for this storage backend".to_string(),
        ))
    }

    /// Archive several messages in one call.
    async fn archive_batch(&self, queue_name: &str, msg_ids: &[i64]) -> Result<()> {
        let _ = (queue_name, msg_ids);
        Err(StorageError::Unsupported(
            "message queues not implemented for this storage backend".to_string(),
        ))
    }

    // ===== Flow Task Operations =====

    /// Lease step tasks queued for the flow served by `queue_name`.
    async fn poll_for_tasks(
        &self,
        queue_name: &str,
        params: PollParams,
    ) -> Result<Vec<StepTaskRecord>> {
        let _ = (queue_name, params);
        Err(StorageError::Unsupported(
            "flow tasks not implemented for this storage backend".to_string(),
        ))
    }

    /// Record a step's output and release its dependents.
    async fn complete_task(&self, run_id: Uuid, step_slug: &str, output: &Value) -> Result<()> {
        let _ = (run_id, step_slug, output);
        Err(StorageError::Unsupported(
            "flow tasks not implemented for this storage backend".to_string(),
        ))
    }

    /// Record a step as permanently failed, failing its run.
    async fn fail_task(&self, run_id: Uuid, step_slug: &str, error_message: &str) -> Result<()> {
        let _ = (run_id, step_slug, error_message);
        Err(StorageError::Unsupported(
            "flow tasks not implemented for this storage backend".to_string(),
        ))
    }
}

// Lets workers share one store behind `Arc<dyn Store>` or a concrete `Arc<S>`.
#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn register_worker(
        &self,
        queue_name: &str,
        worker_id: Uuid,
        function_name: &str,
    ) -> Result<WorkerRow> {
        (**self)
            .register_worker(queue_name, worker_id, function_name)
            .await
    }

    async fn send_heartbeat(&self, worker: &WorkerRow) -> Result<HeartbeatStatus> {
        (**self).send_heartbeat(worker).await
    }

    async fn mark_worker_stopped(&self, worker_id: Uuid) -> Result<()> {
        (**self).mark_worker_stopped(worker_id).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    async fn read_with_poll(&self, queue_name: &str, params: PollParams) -> Result<Vec<MessageRecord>> {
        (**self).read_with_poll(queue_name, params).await
    }

    async fn set_visibility(&self, queue_name: &str, msg_id: i64, delay: Duration) -> Result<()> {
        (**self).set_visibility(queue_name, msg_id, delay).await
    }

    async fn archive(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        (**self).archive(queue_name, msg_id).await
    }

    async fn archive_batch(&self, queue_name: &str, msg_ids: &[i64]) -> Result<()> {
        (**self).archive_batch(queue_name, msg_ids).await
    }

    async fn poll_for_tasks(
        &self,
        queue_name: &str,
        params: PollParams,
    ) -> Result<Vec<StepTaskRecord>> {
        (**self).poll_for_tasks(queue_name, params).await
    }

    async fn complete_task(&self, run_id: Uuid, step_slug: &str, output: &Value) -> Result<()> {
        (**self).complete_task(run_id, step_slug, output).await
    }

    async fn fail_task(&self, run_id: Uuid, step_slug: &str, error_message: &str) -> Result<()> {
        (**self).fail_task(run_id, step_slug, error_message).await
    }
}
