use super::{
    error::Result, error::StorageError, HeartbeatStatus, MessageRecord, PollParams,
    StepTaskRecord, Store, WorkerRow,
};
use crate::graph::{compile_flow, Flow};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default pool size for Postgres connection pool.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Configuration for the Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: u32,
    /// Minimum number of idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub connection_timeout: Duration,
    /// Idle timeout for connections.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            min_idle: None,
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Postgres store backed by the pgmq extension and the pgflow schema.
///
/// Queues are pgmq queues read through `edge_worker.read_with_poll`, flow
/// tasks go through `pgflow.poll_for_tasks`, `pgflow.complete_task` and
/// `pgflow.fail_task`, and workers are tracked in `edge_worker.workers`. The
/// schema is owned by those extensions' migrations; this store never creates
/// tables.
///
/// # Example
///
/// ```ignore
/// use drover::storage::PostgresStore;
///
/// let store = PostgresStore::new("postgres://localhost/app").await?;
/// ```
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects with the default pool configuration.
    pub async fn new(database_url: impl AsRef<str>) -> Result<Self> {
        Self::with_config(database_url, PoolConfig::default()).await
    }

    pub async fn with_config(database_url: impl AsRef<str>, config: PoolConfig) -> Result<Self> {
        let connect_options = PgConnectOptions::from_str(database_url.as_ref())
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let mut builder = PgPoolOptions::new()
            .max_connections(config.max_size)
            .acquire_timeout(config.connection_timeout);
        if let Some(min_idle) = config.min_idle {
            builder = builder.min_connections(min_idle);
        }
        if let Some(idle_timeout) = config.idle_timeout {
            builder = builder.idle_timeout(idle_timeout);
        }

        let pool = builder
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        info!(max_connections = config.max_size, "connected to postgres");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the pgmq queue unless it already exists.
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query(
            "SELECT pgmq.create($1)
             WHERE NOT EXISTS (SELECT 1 FROM pgmq.list_queues() WHERE queue_name = $1)",
        )
        .bind(queue_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sends a message to a pgmq queue. Returns its id.
    pub async fn send(&self, queue_name: &str, message: &Value) -> Result<i64> {
        let row = sqlx::query("SELECT pgmq.send(queue_name => $1, msg => $2::jsonb) AS msg_id")
            .bind(queue_name)
            .bind(message)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("msg_id")?)
    }

    /// Registers `flow` and its steps by running its compiled statements in
    /// one transaction.
    pub async fn install_flow(&self, flow: &Flow) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in compile_flow(flow) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(flow = %flow.slug(), steps = flow.len(), "installed flow");
        Ok(())
    }

    /// Starts a run of an installed flow. Returns the run id.
    pub async fn start_flow(&self, flow_slug: &str, input: &Value) -> Result<Uuid> {
        let row = sqlx::query("SELECT run_id FROM pgflow.start_flow(flow_slug => $1, input => $2::jsonb)")
            .bind(flow_slug)
            .bind(input)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("run_id")?)
    }
}

// pgmq names its tables after the queue, so the name ends up in SQL text
// as a quoted identifier.
fn queue_table(queue_name: &str) -> String {
    format!("pgmq.\"q_{}\"", queue_name.replace('"', "\"\""))
}

fn seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn millis(duration: Duration) -> i32 {
    i32::try_from(duration.as_millis()).unwrap_or(i32::MAX)
}

fn worker_from_row(row: &PgRow) -> Result<WorkerRow> {
    Ok(WorkerRow {
        worker_id: row.try_get("worker_id")?,
        queue_name: row.try_get("queue_name")?,
        function_name: row.try_get("function_name")?,
        started_at: row.try_get("started_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        deprecated_at: row.try_get("deprecated_at")?,
        stopped_at: row.try_get("stopped_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn register_worker(
        &self,
        queue_name: &str,
        worker_id: Uuid,
        function_name: &str,
    ) -> Result<WorkerRow> {
        let row = sqlx::query(
            "INSERT INTO edge_worker.workers (queue_name, worker_id, function_name)
             VALUES ($1, $2, $3)
             RETURNING worker_id, queue_name, function_name, started_at,
                       last_heartbeat_at, deprecated_at, stopped_at",
        )
        .bind(queue_name)
        .bind(worker_id)
        .bind(function_name)
        .fetch_one(&self.pool)
        .await?;
        worker_from_row(&row)
    }

    async fn send_heartbeat(&self, worker: &WorkerRow) -> Result<HeartbeatStatus> {
        let row = sqlx::query(
            "UPDATE edge_worker.workers
             SET last_heartbeat_at = now()
             WHERE worker_id = $1
             RETURNING (deprecated_at IS NOT NULL) AS is_deprecated",
        )
        .bind(worker.worker_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("worker", worker.worker_id))?;
        Ok(HeartbeatStatus {
            is_deprecated: row.try_get("is_deprecated")?,
        })
    }

    async fn mark_worker_stopped(&self, worker_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE edge_worker.workers SET stopped_at = now() WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn read_with_poll(&self, queue_name: &str, params: PollParams) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT msg_id, read_ct, enqueued_at, vt, message
             FROM edge_worker.read_with_poll(
                 queue_name => $1,
                 vt => $2,
                 qty => $3,
                 max_poll_seconds => $4,
                 poll_interval_ms => $5
             )",
        )
        .bind(queue_name)
        .bind(seconds(params.visibility_timeout))
        .bind(i32::try_from(params.batch_size).unwrap_or(i32::MAX))
        .bind(seconds(params.max_poll))
        .bind(millis(params.poll_interval))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<MessageRecord> {
                Ok(MessageRecord {
                    msg_id: row.try_get("msg_id")?,
                    read_ct: row.try_get("read_ct")?,
                    enqueued_at: row.try_get("enqueued_at")?,
                    vt: row.try_get("vt")?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }

    /// `pgmq.set_vt` inlined with `clock_timestamp()` in place of `now()`,
    /// which would pin the new visibility to the start of the transaction.
    async fn set_visibility(&self, queue_name: &str, msg_id: i64, delay: Duration) -> Result<()> {
        let table = queue_table(queue_name);
        let updated = sqlx::query(&format!(
            "UPDATE {table}
             SET vt = (clock_timestamp() + make_interval(secs => $1))
             WHERE msg_id = $2::bigint"
        ))
        .bind(delay.as_secs_f64())
        .bind(msg_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::not_found("message", msg_id));
        }
        Ok(())
    }

    async fn archive(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive(queue_name => $1, msg_id => $2::bigint)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn archive_batch(&self, queue_name: &str, msg_ids: &[i64]) -> Result<()> {
        sqlx::query("SELECT pgmq.archive(queue_name => $1, msg_ids => $2::bigint[])")
            .bind(queue_name)
            .bind(msg_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn poll_for_tasks(
        &self,
        queue_name: &str,
        params: PollParams,
    ) -> Result<Vec<StepTaskRecord>> {
        let rows = sqlx::query(
            "SELECT t.flow_slug, t.run_id, t.step_slug, t.input, t.msg_id,
                    COALESCE(st.attempts_count, 1) AS attempts_count
             FROM pgflow.poll_for_tasks(
                 queue_name => $1,
                 vt => $2,
                 qty => $3,
                 max_poll_seconds => $4,
                 poll_interval_ms => $5
             ) AS t
             LEFT JOIN pgflow.step_tasks st
               ON st.run_id = t.run_id AND st.step_slug = t.step_slug AND st.task_index = 0",
        )
        .bind(queue_name)
        .bind(seconds(params.visibility_timeout))
        .bind(i32::try_from(params.batch_size).unwrap_or(i32::MAX))
        .bind(seconds(params.max_poll))
        .bind(millis(params.poll_interval))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StepTaskRecord> {
                Ok(StepTaskRecord {
                    flow_slug: row.try_get("flow_slug")?,
                    run_id: row.try_get("run_id")?,
                    step_slug: row.try_get("step_slug")?,
                    input: row.try_get("input")?,
                    msg_id: row.try_get("msg_id")?,
                    attempts_count: row.try_get("attempts_count")?,
                })
            })
            .collect()
    }

    async fn complete_task(&self, run_id: Uuid, step_slug: &str, output: &Value) -> Result<()> {
        sqlx::query(
            "SELECT pgflow.complete_task(
                 run_id => $1::uuid,
                 step_slug => $2::text,
                 task_index => 0,
                 output => $3::jsonb
             )",
        )
        .bind(run_id)
        .bind(step_slug)
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_task(&self, run_id: Uuid, step_slug: &str, error_message: &str) -> Result<()> {
        sqlx::query(
            "SELECT pgflow.fail_task(
                 run_id => $1::uuid,
                 step_slug => $2::text,
                 task_index => 0,
                 error_message => $3::text
             )",
        )
        .bind(run_id)
        .bind(step_slug)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
