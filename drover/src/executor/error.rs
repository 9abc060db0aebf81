use super::state::TransitionError;
use crate::config::ConfigError;
use crate::graph::FlowError;
use crate::storage::StorageError;
use thiserror::Error;

/// Execution layer error type.
///
/// Handler failures never surface here: they are settled against the store
/// as retries or permanent failures. These are the faults of the machinery
/// around the handlers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// A store call made while settling work failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The worker lifecycle was driven through a move it does not allow.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A flow definition lookup failed.
    #[error("flow error: {0}")]
    Flow(#[from] FlowError),

    /// Worker settings failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The execution controller no longer admits work.
    #[error("execution controller is closed")]
    ControllerClosed,

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
