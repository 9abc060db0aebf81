use super::{
    error::Result, error::StorageError, HeartbeatStatus, MessageRecord, PollParams, RunStatus,
    StepStatus, StepTaskRecord, Store, WorkerRow,
};
use crate::graph::{Flow, FlowShape, RUN_KEY};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Store operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    RegisterWorker,
    SendHeartbeat,
    MarkWorkerStopped,
    Close,
    ReadWithPoll,
    SetVisibility,
    Archive,
    ArchiveBatch,
    PollForTasks,
    CompleteTask,
    FailTask,
}

/// Point-in-time view of a flow run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub status: RunStatus,
    pub input: Value,
    /// Outputs of the leaf steps keyed by slug, once the run completes.
    pub output: Option<Value>,
    pub steps: BTreeMap<String, StepSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepSnapshot {
    pub status: StepStatus,
    pub attempts_count: i32,
    pub output: Option<Value>,
    pub error_message: Option<String>,
}

struct StoredMessage {
    record: MessageRecord,
    visible_at: Instant,
}

struct RunState {
    flow_slug: String,
    input: Value,
    status: RunStatus,
    remaining_steps: usize,
    steps: HashMap<String, StepState>,
    output: Option<Value>,
}

struct StepState {
    status: StepStatus,
    remaining_deps: usize,
    attempts_count: i32,
    msg_id: Option<i64>,
    output: Option<Value>,
    error_message: Option<String>,
}

/// In-memory queue store using DashMap for concurrent access.
///
/// Implements plain message queues (lease, visibility, archive) and flow
/// runs on top of them: each started step is a message on the queue named
/// after its flow, and completing a step queues the dependents whose
/// dependencies are all complete. Leases use tokio's clock, so tests running
/// with paused time see visibility timeouts and retry delays elapse.
///
/// `fail_task` is terminal: workers only call it once a task's retries are
/// exhausted.
///
/// Every trait call is counted per [`StoreOp`]. Any operation can be made
/// to fail with [`StorageError::Unavailable`] via [`InMemoryStore::fail_on`],
/// or slowed down via [`InMemoryStore::delay_on`]. After
/// [`Store::close`] every other trait call fails, as it would on a closed
/// connection pool.
pub struct InMemoryStore {
    queues: DashMap<String, Vec<StoredMessage>>,
    archives: DashMap<String, Vec<MessageRecord>>,
    archive_batches: DashMap<String, Vec<Vec<i64>>>,
    next_msg_id: AtomicI64,
    flows: DashMap<String, FlowShape>,
    runs: DashMap<Uuid, RunState>,
    workers: DashMap<Uuid, WorkerRow>,
    calls: DashMap<StoreOp, usize>,
    failing: DashSet<StoreOp>,
    latency: DashMap<StoreOp, Duration>,
    closed: AtomicBool,
    /// Wakes long-polling readers when a message is queued
    work_notify: Arc<Notify>,
    /// Wakes waiters when a run finishes
    status_notify: Arc<Notify>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            archives: DashMap::new(),
            archive_batches: DashMap::new(),
            next_msg_id: AtomicI64::new(1),
            flows: DashMap::new(),
            runs: DashMap::new(),
            workers: DashMap::new(),
            calls: DashMap::new(),
            failing: DashSet::new(),
            latency: DashMap::new(),
            closed: AtomicBool::new(false),
            work_notify: Arc::new(Notify::new()),
            status_notify: Arc::new(Notify::new()),
        }
    }

    // ===== Queues =====

    /// Queues `message`, visible immediately. Returns its id.
    pub fn send(&self, queue_name: &str, message: Value) -> i64 {
        self.send_delayed(queue_name, message, Duration::ZERO)
    }

    /// Queues `message`, visible after `delay`. Returns its id.
    pub fn send_delayed(&self, queue_name: &str, message: Value, delay: Duration) -> i64 {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let record = MessageRecord {
            msg_id,
            read_ct: 0,
            enqueued_at: now,
            vt: now + to_chrono(delay),
            message,
        };
        self.queues
            .entry(queue_name.to_string())
            .or_default()
            .push(StoredMessage {
                record,
                visible_at: Instant::now() + delay,
            });
        self.work_notify.notify_waiters();
        msg_id
    }

    /// A message still on the queue (leased or not).
    pub fn message(&self, queue_name: &str, msg_id: i64) -> Option<MessageRecord> {
        self.queues.get(queue_name).and_then(|queue| {
            queue
                .iter()
                .find(|m| m.record.msg_id == msg_id)
                .map(|m| m.record.clone())
        })
    }

    /// Messages still on the queue, leased or not.
    pub fn queue_len(&self, queue_name: &str) -> usize {
        self.queues.get(queue_name).map_or(0, |queue| queue.len())
    }

    pub fn archived(&self, queue_name: &str) -> Vec<MessageRecord> {
        self.archives
            .get(queue_name)
            .map(|archive| archive.clone())
            .unwrap_or_default()
    }

    pub fn archived_ids(&self, queue_name: &str) -> Vec<i64> {
        self.archived(queue_name).iter().map(|m| m.msg_id).collect()
    }

    /// Id lists of every `archive_batch` call on the queue, in call order.
    pub fn archive_batches(&self, queue_name: &str) -> Vec<Vec<i64>> {
        self.archive_batches
            .get(queue_name)
            .map(|batches| batches.clone())
            .unwrap_or_default()
    }

    fn lease(&self, queue_name: &str, batch_size: u32, visibility: Duration) -> Vec<MessageRecord> {
        let now = Instant::now();
        let Some(mut queue) = self.queues.get_mut(queue_name) else {
            return Vec::new();
        };
        let mut leased = Vec::new();
        for stored in queue.iter_mut() {
            if leased.len() >= batch_size as usize {
                break;
            }
            if stored.visible_at <= now {
                stored.visible_at = now + visibility;
                stored.record.read_ct += 1;
                stored.record.vt = Utc::now() + to_chrono(visibility);
                leased.push(stored.record.clone());
            }
        }
        leased
    }

    async fn lease_with_poll(&self, queue_name: &str, params: PollParams) -> Vec<MessageRecord> {
        let deadline = Instant::now() + params.max_poll;
        loop {
            // Registered before the check so a send in between is not missed
            let notified = self.work_notify.notified();
            let leased = self.lease(queue_name, params.batch_size, params.visibility_timeout);
            let now = Instant::now();
            if !leased.is_empty() || now >= deadline {
                return leased;
            }
            let wait = params.poll_interval.min(deadline - now);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn archive_message(&self, queue_name: &str, msg_id: i64) -> bool {
        let removed = self.queues.get_mut(queue_name).and_then(|mut queue| {
            let index = queue.iter().position(|m| m.record.msg_id == msg_id)?;
            Some(queue.remove(index).record)
        });
        match removed {
            Some(record) => {
                self.archives
                    .entry(queue_name.to_string())
                    .or_default()
                    .push(record);
                true
            }
            None => false,
        }
    }

    // ===== Flows =====

    /// Makes `flow` startable with [`InMemoryStore::start_flow`].
    pub fn register_flow(&self, flow: &Flow) {
        self.register_flow_shape(FlowShape::of(flow));
    }

    pub fn register_flow_shape(&self, shape: FlowShape) {
        self.flows.insert(shape.slug.to_string(), shape);
    }

    /// Starts a run of a registered flow, queueing its root steps.
    pub fn start_flow(&self, flow_slug: &str, input: Value) -> Result<Uuid> {
        let shape = self
            .flows
            .get(flow_slug)
            .map(|shape| shape.clone())
            .ok_or_else(|| StorageError::not_found("flow", flow_slug))?;

        let run_id = Uuid::new_v4();
        let mut steps = HashMap::with_capacity(shape.steps.len());
        for step in &shape.steps {
            steps.insert(
                step.slug.to_string(),
                StepState {
                    status: StepStatus::Created,
                    remaining_deps: step.dependencies.len(),
                    attempts_count: 0,
                    msg_id: None,
                    output: None,
                    error_message: None,
                },
            );
        }
        let mut run = RunState {
            flow_slug: flow_slug.to_string(),
            input,
            status: RunStatus::Started,
            remaining_steps: shape.steps.len(),
            steps,
            output: None,
        };

        let roots: Vec<String> = shape
            .steps
            .iter()
            .filter(|step| step.dependencies.is_empty())
            .map(|step| step.slug.to_string())
            .collect();
        for slug in roots {
            self.queue_step(run_id, &mut run, &slug);
        }
        if run.remaining_steps == 0 {
            run.status = RunStatus::Completed;
            run.output = Some(Value::Object(Map::new()));
        }
        self.runs.insert(run_id, run);
        Ok(run_id)
    }

    fn queue_step(&self, run_id: Uuid, run: &mut RunState, step_slug: &str) {
        let msg_id = self.send(
            &run.flow_slug,
            json!({"run_id": run_id, "step_slug": step_slug}),
        );
        if let Some(step) = run.steps.get_mut(step_slug) {
            step.status = StepStatus::Started;
            step.msg_id = Some(msg_id);
        }
    }

    pub fn run(&self, run_id: Uuid) -> Option<RunSnapshot> {
        self.runs.get(&run_id).map(|run| RunSnapshot {
            run_id,
            flow_slug: run.flow_slug.clone(),
            status: run.status,
            input: run.input.clone(),
            output: run.output.clone(),
            steps: run
                .steps
                .iter()
                .map(|(slug, step)| {
                    (
                        slug.clone(),
                        StepSnapshot {
                            status: step.status,
                            attempts_count: step.attempts_count,
                            output: step.output.clone(),
                            error_message: step.error_message.clone(),
                        },
                    )
                })
                .collect(),
        })
    }

    /// Waits up to `timeout` for a run to leave `Started`.
    pub async fn wait_for_run(&self, run_id: Uuid, timeout: Duration) -> Option<RunSnapshot> {
        let wait = async {
            loop {
                let notified = self.status_notify.notified();
                match self.run(run_id) {
                    Some(run) if run.status != RunStatus::Started => return Some(run),
                    None => return None,
                    Some(_) => notified.await,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Turns a leased flow message into a task, charging the attempt.
    ///
    /// Messages for runs that already finished are archived and skipped.
    fn start_task(&self, queue_name: &str, message: MessageRecord) -> Option<StepTaskRecord> {
        let run_id = message
            .message
            .get("run_id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok());
        let step_slug = message
            .message
            .get("step_slug")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (Some(run_id), Some(step_slug)) = (run_id, step_slug) else {
            tracing::warn!(queue = queue_name, msg_id = message.msg_id, "dropping malformed task message");
            self.archive_message(queue_name, message.msg_id);
            return None;
        };

        let task = self.runs.get_mut(&run_id).and_then(|mut run| {
            let input = self.step_input(&run, &step_slug);
            let run_started = run.status == RunStatus::Started;
            match run.steps.get_mut(&step_slug) {
                Some(step) if run_started && step.status == StepStatus::Started => {
                    step.attempts_count += 1;
                    input.map(|input| StepTaskRecord {
                        flow_slug: queue_name.to_string(),
                        run_id,
                        step_slug: step_slug.clone(),
                        input,
                        msg_id: message.msg_id,
                        attempts_count: step.attempts_count,
                    })
                }
                _ => None,
            }
        });
        if task.is_none() {
            self.archive_message(queue_name, message.msg_id);
        }
        task
    }

    fn step_input(&self, run: &RunState, step_slug: &str) -> Option<Value> {
        let shape = self.flows.get(&run.flow_slug)?;
        let step = shape.step(step_slug)?;
        let mut input = Map::new();
        input.insert(RUN_KEY.to_string(), run.input.clone());
        for dep in &step.dependencies {
            let output = run
                .steps
                .get(dep.as_str())
                .and_then(|state| state.output.clone())
                .unwrap_or(Value::Null);
            input.insert(dep.to_string(), output);
        }
        Some(Value::Object(input))
    }

    // ===== Workers =====

    pub fn worker(&self, worker_id: Uuid) -> Option<WorkerRow> {
        self.workers.get(&worker_id).map(|row| row.clone())
    }

    pub fn workers(&self, queue_name: &str) -> Vec<WorkerRow> {
        self.workers
            .iter()
            .filter(|row| row.queue_name == queue_name)
            .map(|row| row.clone())
            .collect()
    }

    /// Flags every live worker on `queue_name` for retirement.
    pub fn deprecate_workers(&self, queue_name: &str) {
        let now = Utc::now();
        for mut row in self.workers.iter_mut() {
            if row.queue_name == queue_name && row.stopped_at.is_none() {
                row.deprecated_at.get_or_insert(now);
            }
        }
    }

    // ===== Instrumentation =====

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.calls.get(&op).map_or(0, |count| *count)
    }

    /// Makes every later call of `op` fail with [`StorageError::Unavailable`].
    pub fn fail_on(&self, op: StoreOp) {
        self.failing.insert(op);
    }

    pub fn recover(&self, op: StoreOp) {
        self.failing.remove(&op);
    }

    /// Makes every later call of `op` take `by` (on tokio's clock) before
    /// it runs.
    pub fn delay_on(&self, op: StoreOp, by: Duration) {
        self.latency.insert(op, by);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn record(&self, op: StoreOp) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        let delay = self.latency.get(&op).map(|by| *by);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if op != StoreOp::Close && self.is_closed() {
            return Err(StorageError::Unavailable("store is closed".to_string()));
        }
        if self.failing.contains(&op) {
            return Err(StorageError::Unavailable(format!("{op:?} is failing")));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn register_worker(
        &self,
        queue_name: &str,
        worker_id: Uuid,
        function_name: &str,
    ) -> Result<WorkerRow> {
        self.record(StoreOp::RegisterWorker).await?;
        let now = Utc::now();
        let row = WorkerRow {
            worker_id,
            queue_name: queue_name.to_string(),
            function_name: function_name.to_string(),
            started_at: now,
            last_heartbeat_at: now,
            deprecated_at: None,
            stopped_at: None,
        };
        self.workers.insert(worker_id, row.clone());
        Ok(row)
    }

    async fn send_heartbeat(&self, worker: &WorkerRow) -> Result<HeartbeatStatus> {
        self.record(StoreOp::SendHeartbeat).await?;
        let mut row = self
            .workers
            .get_mut(&worker.worker_id)
            .ok_or_else(|| StorageError::not_found("worker", worker.worker_id))?;
        row.last_heartbeat_at = Utc::now();
        Ok(HeartbeatStatus {
            is_deprecated: row.deprecated_at.is_some(),
        })
    }

    async fn mark_worker_stopped(&self, worker_id: Uuid) -> Result<()> {
        self.record(StoreOp::MarkWorkerStopped).await?;
        let mut row = self
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| StorageError::not_found("worker", worker_id))?;
        row.stopped_at = Some(Utc::now());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(StoreOp::Close).await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_with_poll(&self, queue_name: &str, params: PollParams) -> Result<Vec<MessageRecord>> {
        self.record(StoreOp::ReadWithPoll).await?;
        Ok(self.lease_with_poll(queue_name, params).await)
    }

    async fn set_visibility(&self, queue_name: &str, msg_id: i64, delay: Duration) -> Result<()> {
        self.record(StoreOp::SetVisibility).await?;
        let mut queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| StorageError::not_found("queue", queue_name))?;
        let stored = queue
            .iter_mut()
            .find(|m| m.record.msg_id == msg_id)
            .ok_or_else(|| StorageError::not_found("message", msg_id))?;
        stored.visible_at = Instant::now() + delay;
        stored.record.vt = Utc::now() + to_chrono(delay);
        Ok(())
    }

    async fn archive(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        self.record(StoreOp::Archive).await?;
        self.archive_message(queue_name, msg_id);
        Ok(())
    }

    async fn archive_batch(&self, queue_name: &str, msg_ids: &[i64]) -> Result<()> {
        self.record(StoreOp::ArchiveBatch).await?;
        self.archive_batches
            .entry(queue_name.to_string())
            .or_default()
            .push(msg_ids.to_vec());
        for msg_id in msg_ids {
            self.archive_message(queue_name, *msg_id);
        }
        Ok(())
    }

    async fn poll_for_tasks(
        &self,
        queue_name: &str,
        params: PollParams,
    ) -> Result<Vec<StepTaskRecord>> {
        self.record(StoreOp::PollForTasks).await?;
        let deadline = Instant::now() + params.max_poll;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let messages = self
                .lease_with_poll(queue_name, PollParams { max_poll: remaining, ..params })
                .await;
            let leased = !messages.is_empty();
            let tasks: Vec<StepTaskRecord> = messages
                .into_iter()
                .filter_map(|message| self.start_task(queue_name, message))
                .collect();
            // Every leased message may have been stale; keep polling
            if !tasks.is_empty() || !leased || Instant::now() >= deadline {
                return Ok(tasks);
            }
        }
    }

    async fn complete_task(&self, run_id: Uuid, step_slug: &str, output: &Value) -> Result<()> {
        self.record(StoreOp::CompleteTask).await?;
        let finished = {
            let mut run = self
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| StorageError::not_found("run", run_id))?;
            let run = &mut *run;
            let step = run
                .steps
                .get_mut(step_slug)
                .ok_or_else(|| StorageError::not_found("step", step_slug))?;
            if run.status != RunStatus::Started || step.status != StepStatus::Started {
                return Ok(());
            }
            step.status = StepStatus::Completed;
            step.output = Some(output.clone());
            if let Some(msg_id) = step.msg_id {
                self.archive_message(&run.flow_slug, msg_id);
            }

            let shape = self
                .flows
                .get(&run.flow_slug)
                .map(|shape| shape.clone())
                .ok_or_else(|| StorageError::not_found("flow", &run.flow_slug))?;
            let mut ready = Vec::new();
            for dependent in shape.dependents(step_slug) {
                if let Some(state) = run.steps.get_mut(dependent.slug.as_str()) {
                    state.remaining_deps = state.remaining_deps.saturating_sub(1);
                    if state.remaining_deps == 0 && state.status == StepStatus::Created {
                        ready.push(dependent.slug.to_string());
                    }
                }
            }
            for slug in ready {
                self.queue_step(run_id, run, &slug);
            }

            run.remaining_steps = run.remaining_steps.saturating_sub(1);
            if run.remaining_steps == 0 {
                let mut output = Map::new();
                for step in &shape.steps {
                    if shape.dependents(step.slug.as_str()).next().is_none() {
                        let value = run
                            .steps
                            .get(step.slug.as_str())
                            .and_then(|state| state.output.clone())
                            .unwrap_or(Value::Null);
                        output.insert(step.slug.to_string(), value);
                    }
                }
                run.status = RunStatus::Completed;
                run.output = Some(Value::Object(output));
                true
            } else {
                false
            }
        };
        if finished {
            tracing::debug!(run_id = %run_id, "run completed");
            self.status_notify.notify_waiters();
        }
        Ok(())
    }

    async fn fail_task(&self, run_id: Uuid, step_slug: &str, error_message: &str) -> Result<()> {
        self.record(StoreOp::FailTask).await?;
        {
            let mut run = self
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| StorageError::not_found("run", run_id))?;
            let run = &mut *run;
            let step = run
                .steps
                .get_mut(step_slug)
                .ok_or_else(|| StorageError::not_found("step", step_slug))?;
            if step.status != StepStatus::Started {
                return Ok(());
            }
            step.status = StepStatus::Failed;
            step.error_message = Some(error_message.to_string());
            if let Some(msg_id) = step.msg_id {
                self.archive_message(&run.flow_slug, msg_id);
            }
            run.status = RunStatus::Failed;
        }
        tracing::debug!(run_id = %run_id, step = step_slug, "run failed");
        self.status_notify.notify_waiters();
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
