//! Worker configuration
//!
//! Plain structs with defaults, loadable from any serde source. Durations are
//! stored as integer seconds or milliseconds, as their field names say.

use crate::core::{InvalidRetryConfig, RetryConfig};
use crate::storage::PollParams;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Settings rejected before a worker is built.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error(transparent)]
    Retry(#[from] InvalidRetryConfig),

    #[error("{field} must be greater than 0")]
    Zero { field: &'static str },

    #[error("invalid queue name \"{name}\": {reason}")]
    QueueName { name: String, reason: String },
}

/// Settings shared by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue to lease from. Flow workers fall back to the flow slug.
    pub queue_name: Option<String>,
    /// Name recorded in the worker registry.
    pub function_name: String,
    /// Executions allowed in flight at once.
    pub max_concurrent: usize,
    /// Items leased per poll.
    pub batch_size: u32,
    /// Longest a single poll waits for work.
    pub max_poll_seconds: u32,
    /// Pause between checks while a poll waits.
    pub poll_interval_ms: u64,
    /// Lease length for polled items.
    pub visibility_timeout: u32,
    /// Minimum gap between heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Close the store once the worker has stopped. Leave off when the store
    /// is shared with other workers.
    pub close_store_on_stop: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: None,
            function_name: "drover".to_string(),
            max_concurrent: 10,
            batch_size: 10,
            max_poll_seconds: 5,
            poll_interval_ms: 200,
            visibility_timeout: 10,
            heartbeat_interval_ms: 5000,
            close_store_on_stop: false,
        }
    }
}

impl WorkerConfig {
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_function_name(mut self, function_name: impl Into<String>) -> Self {
        self.function_name = function_name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_poll_seconds(mut self, seconds: u32) -> Self {
        self.max_poll_seconds = seconds;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout = seconds;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_close_store_on_stop(mut self, close: bool) -> Self {
        self.close_store_on_stop = close;
        self
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_poll_seconds))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility(&self) -> Duration {
        Duration::from_secs(u64::from(self.visibility_timeout))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_params(&self) -> PollParams {
        PollParams {
            batch_size: self.batch_size,
            visibility_timeout: self.visibility(),
            max_poll: self.max_poll(),
            poll_interval: self.poll_interval(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Zero {
                field: "max_concurrent",
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { field: "batch_size" });
        }
        if self.visibility_timeout == 0 {
            return Err(ConfigError::Zero {
                field: "visibility_timeout",
            });
        }
        if let Some(name) = &self.queue_name {
            if name.is_empty() {
                return Err(ConfigError::QueueName {
                    name: name.clone(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Settings for a worker serving a plain message queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueWorkerConfig {
    #[serde(flatten)]
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    /// Successful messages archived per store call.
    pub archive_batch_size: usize,
    /// Longest a successful message waits to be archived.
    pub archive_timeout_ms: u64,
}

/// Queue served when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "tasks";

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            archive_batch_size: 100,
            archive_timeout_ms: 500,
        }
    }
}

impl QueueWorkerConfig {
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_archive_batch_size(mut self, size: usize) -> Self {
        self.archive_batch_size = size;
        self
    }

    pub fn with_archive_timeout(mut self, timeout: Duration) -> Self {
        self.archive_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn queue_name(&self) -> &str {
        self.worker.queue_name.as_deref().unwrap_or(DEFAULT_QUEUE_NAME)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_millis(self.archive_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker.validate()?;
        self.retry.validate()?;
        if self.archive_batch_size == 0 {
            return Err(ConfigError::Zero {
                field: "archive_batch_size",
            });
        }
        Ok(())
    }
}

/// Settings for a worker executing the steps of one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowWorkerConfig {
    #[serde(flatten)]
    pub worker: WorkerConfig,
}

impl Default for FlowWorkerConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig {
                visibility_timeout: 2,
                ..WorkerConfig::default()
            },
        }
    }
}

impl FlowWorkerConfig {
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_defaults() {
        let config = QueueWorkerConfig::default();
        assert_eq!(config.queue_name(), "tasks");
        assert_eq!(config.worker.max_concurrent, 10);
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.worker.max_poll(), Duration::from_secs(5));
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.worker.visibility(), Duration::from_secs(10));
        assert_eq!(config.worker.heartbeat_interval(), Duration::from_secs(5));
        assert!(!config.worker.close_store_on_stop);
        assert_eq!(config.retry, RetryConfig::exponential(5, 3, 300));
        assert_eq!(config.archive_batch_size, 100);
        assert_eq!(config.archive_timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flow_defaults_use_short_visibility() {
        let config = FlowWorkerConfig::default();
        assert_eq!(config.worker.visibility(), Duration::from_secs(2));
        assert_eq!(config.worker.queue_name, None);
    }

    #[test]
    fn test_validation_catches_zeroes_and_bad_retry() {
        let config = QueueWorkerConfig::default()
            .with_worker(WorkerConfig::default().with_max_concurrent(0));
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_concurrent"
            })
        );

        let config = QueueWorkerConfig::default().with_retry(RetryConfig::fixed(1, 0));
        assert!(matches!(config.validate(), Err(ConfigError::Retry(_))));

        let config =
            FlowWorkerConfig::default().with_worker(WorkerConfig::default().with_queue_name(""));
        assert!(matches!(config.validate(), Err(ConfigError::QueueName { .. })));
    }

    #[test]
    fn test_deserializes_with_defaults() {
        let config: QueueWorkerConfig = serde_json::from_value(serde_json::json!({
            "queue_name": "emails",
            "max_concurrent": 2,
            "retry": {"strategy": "fixed", "limit": 1, "base_delay": 4}
        }))
        .unwrap();
        assert_eq!(config.queue_name(), "emails");
        assert_eq!(config.worker.max_concurrent, 2);
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.retry, RetryConfig::fixed(1, 4));
    }
}
