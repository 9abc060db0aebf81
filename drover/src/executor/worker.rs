//! The top-level worker loop.
//!
//! A [`Worker`] ties a [`WorkerLifecycle`] to a [`BatchProcessing`]
//! implementation. Once started it loops heartbeat, poll, dispatch until it
//! is stopped or the store deprecates it. Stopping raises the shared
//! cancellation token, drains in-flight executions and records the stop.
//! The store is closed too, but only for a worker built to own it.
//!
//! Workers are built by [`create_queue_worker`](super::create_queue_worker)
//! and [`create_flow_worker`](super::create_flow_worker).

use super::batch::BatchProcessing;
use super::error::Result;
use super::lifecycle::{WorkerBootstrap, WorkerLifecycle};
use super::state::WorkerState;
use crate::storage::Store;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Handle to a worker. Clones share the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    function_name: String,
    lifecycle: WorkerLifecycle,
    processor: Arc<dyn BatchProcessing>,
    /// Closed once the worker has stopped
    owned_store: Option<Arc<dyn Store>>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    main_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// `shutdown` must be the token the processor's poller and executors
    /// watch. Pass `owned_store` only when no other worker uses that store:
    /// it is closed when this worker stops.
    pub fn new(
        function_name: impl Into<String>,
        lifecycle: WorkerLifecycle,
        processor: Arc<dyn BatchProcessing>,
        owned_store: Option<Arc<dyn Store>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                function_name: function_name.into(),
                lifecycle,
                processor,
                owned_store,
                shutdown,
                stopped: CancellationToken::new(),
                main_loop: Mutex::new(None),
            }),
        }
    }

    /// Starts the worker under a fresh id and its configured function name.
    pub async fn start(&self) -> Result<()> {
        self.start_only_once(WorkerBootstrap::new(&self.inner.function_name))
            .await
    }

    /// Registers the worker and spawns its main loop.
    ///
    /// Only the first call does anything; later calls return `Ok(())`
    /// whatever state the worker is in. If registration fails the worker
    /// stays in `Starting` and will not start again.
    pub async fn start_only_once(&self, bootstrap: WorkerBootstrap) -> Result<()> {
        if !self.inner.lifecycle.begin_start() {
            debug!(state = %self.state(), "worker already started; ignoring start");
            return Ok(());
        }

        self.inner.lifecycle.acknowledge_start(&bootstrap).await?;

        let span = info_span!(
            "worker",
            worker.id = %bootstrap.worker_id,
            queue = %self.inner.lifecycle.queue_name()
        );
        let inner = Arc::clone(&self.inner);
        let mut main_loop = self.inner.main_loop.lock().expect("main loop mutex poisoned");
        *main_loop = Some(tokio::spawn(inner.run().instrument(span)));
        Ok(())
    }

    /// Stops the worker and waits until it has fully stopped.
    ///
    /// In-flight handlers see the cancellation and their items are left for
    /// redelivery. Calling `stop` again, or while the worker is already
    /// stopping on its own, waits for that stop instead of starting another.
    ///
    /// Stopping a worker that never reached `Running` is an error. If
    /// registration is still in flight the stop is remembered anyway: the
    /// worker stops itself as soon as its main loop starts.
    pub async fn stop(&self) -> Result<()> {
        let began = match self.inner.lifecycle.begin_stop() {
            Ok(began) => began,
            Err(e) => {
                // Registration may finish at any moment; the main loop
                // checks the token before its first cycle.
                if self.state() != WorkerState::Created {
                    self.inner.shutdown.cancel();
                }
                return Err(e.into());
            }
        };
        self.inner.shutdown.cancel();
        if !began {
            self.stopped().await;
            return Ok(());
        }

        info!(queue = %self.inner.lifecycle.queue_name(), "stopping worker");
        let main_loop = self
            .inner
            .main_loop
            .lock()
            .expect("main loop mutex poisoned")
            .take();
        if let Some(handle) = main_loop {
            if let Err(e) = handle.await {
                error!(error = %e, "worker main loop panicked");
            }
        }
        self.inner.finish_stop().await;
        Ok(())
    }

    /// Completes once the worker is `Stopped`, however it got there.
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lifecycle.state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }

    /// Id the worker registered with, once started.
    pub fn worker_id(&self) -> Option<Uuid> {
        self.inner.lifecycle.worker_row().map(|row| row.worker_id)
    }

    pub fn queue_name(&self) -> &str {
        self.inner.lifecycle.queue_name()
    }
}

impl WorkerInner {
    async fn run(self: Arc<Self>) {
        while self.lifecycle.is_running() && !self.shutdown.is_cancelled() {
            if let Err(e) = self.lifecycle.send_heartbeat().await {
                warn!(error = %e, "heartbeat failed");
            }
            if !self.lifecycle.is_running() {
                break;
            }
            if let Err(e) = self.processor.process_batch().await {
                error!(error = %e, "batch processing failed");
            }
        }

        // Unless `stop` already took over, the worker stops itself: it was
        // deprecated, or stopped while still registering.
        let deprecated = self.lifecycle.is_deprecated();
        match self.lifecycle.begin_stop() {
            Ok(true) => {
                info!(deprecated, "worker stopping itself");
                self.finish_stop().await
            }
            Ok(false) => {}
            Err(e) => error!(error = %e, "could not stop worker"),
        }
    }

    async fn finish_stop(&self) {
        if let Err(e) = self.processor.await_completion().await {
            warn!(error = %e, "error while draining executions");
        }
        if let Err(e) = self.lifecycle.acknowledge_stop().await {
            error!(error = %e, "could not acknowledge stop");
        }
        if let Some(store) = &self.owned_store {
            if let Err(e) = store.close().await {
                warn!(error = %e, "failed to close store");
            }
        }
        self.stopped.cancel();
    }
}
