//! Worker lifecycle: registration, heartbeats and the state machine.
//!
//! The lifecycle owns the worker's [`WorkerState`] and is the only thing that
//! moves it. It registers the worker with the store on start, forwards
//! heartbeats and turns a deprecation answer into the `Deprecated` state, and
//! records the stop.

use super::heartbeat::Heartbeat;
use super::state::{TransitionError, WorkerState, WorkerStateMachine};
use crate::storage::{Result as StorageResult, Store, WorkerRow};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Identity a worker registers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBootstrap {
    pub worker_id: Uuid,
    pub function_name: String,
}

impl WorkerBootstrap {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            function_name: function_name.into(),
        }
    }
}

pub struct WorkerLifecycle {
    store: Arc<dyn Store>,
    queue_name: String,
    heartbeat_interval: Duration,
    state: Mutex<WorkerStateMachine>,
    worker_row: Mutex<Option<WorkerRow>>,
    heartbeat: tokio::sync::Mutex<Option<Heartbeat>>,
}

impl WorkerLifecycle {
    pub fn new(store: Arc<dyn Store>, queue_name: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
            heartbeat_interval,
            state: Mutex::new(WorkerStateMachine::new()),
            worker_row: Mutex::new(None),
            heartbeat: tokio::sync::Mutex::new(None),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> WorkerState {
        self.machine().current()
    }

    pub fn worker_row(&self) -> Option<WorkerRow> {
        self.worker_row
            .lock()
            .expect("worker row mutex poisoned")
            .clone()
    }

    pub fn is_created(&self) -> bool {
        self.machine().is_created()
    }

    pub fn is_running(&self) -> bool {
        self.machine().is_running()
    }

    pub fn is_deprecated(&self) -> bool {
        self.machine().is_deprecated()
    }

    pub fn is_stopping(&self) -> bool {
        self.machine().is_stopping()
    }

    pub fn is_stopped(&self) -> bool {
        self.machine().is_stopped()
    }

    fn machine(&self) -> std::sync::MutexGuard<'_, WorkerStateMachine> {
        self.state.lock().expect("worker state mutex poisoned")
    }

    pub fn transition_to(&self, to: WorkerState) -> Result<(), TransitionError> {
        self.machine().transition_to(to)
    }

    /// Moves `Created -> Starting` atomically; `false` if the worker had
    /// already left `Created`.
    pub fn begin_start(&self) -> bool {
        let mut machine = self.machine();
        machine.is_created() && machine.transition_to(WorkerState::Starting).is_ok()
    }

    /// Moves to `Stopping` unless the worker is already stopping or stopped.
    ///
    /// Returns `Ok(false)` when there was nothing to do. Stopping a worker
    /// that never reached `Running` is a [`TransitionError`].
    pub fn begin_stop(&self) -> Result<bool, TransitionError> {
        let mut machine = self.machine();
        if machine.is_stopping() || machine.is_stopped() {
            return Ok(false);
        }
        machine.transition_to(WorkerState::Stopping)?;
        Ok(true)
    }

    /// Registers the worker and moves it to `Running`.
    ///
    /// Expects `Starting`; a worker still in `Created` is moved through
    /// `Starting` first.
    pub async fn acknowledge_start(&self, bootstrap: &WorkerBootstrap) -> crate::executor::Result<WorkerRow> {
        {
            let mut machine = self.machine();
            if machine.is_created() {
                machine.transition_to(WorkerState::Starting)?;
            }
        }

        let row = self
            .store
            .register_worker(&self.queue_name, bootstrap.worker_id, &bootstrap.function_name)
            .await?;

        *self.worker_row.lock().expect("worker row mutex poisoned") = Some(row.clone());
        *self.heartbeat.lock().await = Some(Heartbeat::new(
            self.heartbeat_interval,
            Arc::clone(&self.store),
            row.clone(),
        ));

        self.transition_to(WorkerState::Running)?;
        info!(
            worker.id = %row.worker_id,
            queue = %self.queue_name,
            function = %row.function_name,
            "worker started"
        );
        Ok(row)
    }

    /// Sends a heartbeat if one is due, moving to `Deprecated` when the store
    /// says so. Store failures are returned for the caller to log.
    pub async fn send_heartbeat(&self) -> StorageResult<()> {
        let status = {
            let mut heartbeat = self.heartbeat.lock().await;
            match heartbeat.as_mut() {
                Some(heartbeat) => heartbeat.send().await?,
                None => return Ok(()),
            }
        };

        if let Some(status) = status {
            if status.is_deprecated {
                let mut machine = self.machine();
                if machine.is_running() && machine.transition_to(WorkerState::Deprecated).is_ok() {
                    info!(queue = %self.queue_name, "worker deprecated; no new work will be taken");
                }
            }
        }
        Ok(())
    }

    /// Moves `Stopping -> Stopped`, then records the stop with the store.
    ///
    /// The store update is best effort: a failure is logged and the worker
    /// is stopped regardless.
    pub async fn acknowledge_stop(&self) -> Result<(), TransitionError> {
        self.transition_to(WorkerState::Stopped)?;

        if let Some(row) = self.worker_row() {
            if let Err(e) = self.store.mark_worker_stopped(row.worker_id).await {
                warn!(worker.id = %row.worker_id, error = %e, "failed to record worker stop");
            }
        }
        info!(queue = %self.queue_name, "worker stopped");
        Ok(())
    }
}
