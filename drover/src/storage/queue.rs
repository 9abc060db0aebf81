//! Records exchanged with the store.
//!
//! Leased items are handed out by long-poll reads and stay invisible to other
//! readers until their visibility timeout passes. A worker settles an item by
//! archiving it, completing or failing its task, or pushing its visibility
//! out for a retry; an item it never settles is simply delivered again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Anything a poller leases and an executor settles.
pub trait LeasedItem: Clone + Send + Sync + 'static {
    /// Store-assigned message id backing the lease.
    fn msg_id(&self) -> i64;

    /// How many times the store has handed this item out, 1 on first delivery.
    fn read_count(&self) -> u32;
}

/// A message leased from a plain queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Instant the lease expires and the message becomes visible again.
    pub vt: DateTime<Utc>,
    pub message: Value,
}

impl LeasedItem for MessageRecord {
    fn msg_id(&self) -> i64 {
        self.msg_id
    }

    fn read_count(&self) -> u32 {
        u32::try_from(self.read_ct).unwrap_or(0)
    }
}

/// A flow step task leased for execution.
///
/// `input` is the step's full input: the run input under `run` plus one key
/// per dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTaskRecord {
    pub flow_slug: String,
    pub run_id: Uuid,
    pub step_slug: String,
    pub input: Value,
    pub msg_id: i64,
    #[serde(default)]
    pub attempts_count: i32,
}

impl LeasedItem for StepTaskRecord {
    fn msg_id(&self) -> i64 {
        self.msg_id
    }

    fn read_count(&self) -> u32 {
        u32::try_from(self.attempts_count).unwrap_or(0)
    }
}

/// A worker's registration row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRow {
    pub worker_id: Uuid,
    pub queue_name: String,
    pub function_name: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub deprecated_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Store's answer to a heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    /// The worker should stop taking new work and shut down.
    pub is_deprecated: bool,
}

/// Status of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Waiting on dependencies.
    Created,
    /// Queued or leased for execution.
    Started,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Created => "created",
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(StepStatus::Created),
            "started" => Ok(StepStatus::Started),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            _ => Err(format!("unknown step status: {s}")),
        }
    }
}

/// Status of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(RunStatus::Started),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("unknown run status: {s}")),
        }
    }
}
