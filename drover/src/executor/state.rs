//! Worker lifecycle states
//!
//! ```text
//! Created -> Starting -> Running -> Stopping -> Stopped
//!                           |           ^
//!                           v           |
//!                       Deprecated -----+
//! ```
//!
//! Any other move, including a move to the current state, is a
//! [`TransitionError`]. Callers that want idempotence check the state first.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Constructed, not yet started.
    Created,
    /// Registering with the store.
    Starting,
    /// Polling and executing work.
    Running,
    /// Told by the store to retire; takes no new work.
    Deprecated,
    /// Draining in-flight work.
    Stopping,
    /// Fully stopped.
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Deprecated => "deprecated",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Created, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Running, Deprecated)
                | (Deprecated, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A move the lifecycle does not allow.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Cannot transition from {from} to {to}")]
pub struct TransitionError {
    pub from: WorkerState,
    pub to: WorkerState,
}

/// Holds the current [`WorkerState`] and enforces the allowed moves.
#[derive(Debug, Clone)]
pub struct WorkerStateMachine {
    current: WorkerState,
}

impl WorkerStateMachine {
    pub fn new() -> Self {
        Self {
            current: WorkerState::Created,
        }
    }

    pub fn current(&self) -> WorkerState {
        self.current
    }

    pub fn transition_to(&mut self, to: WorkerState) -> Result<(), TransitionError> {
        if !self.current.can_transition_to(to) {
            return Err(TransitionError {
                from: self.current,
                to,
            });
        }
        tracing::debug!(from = %self.current, to = %to, "worker state transition");
        self.current = to;
        Ok(())
    }

    pub fn is_created(&self) -> bool {
        self.current == WorkerState::Created
    }

    pub fn is_running(&self) -> bool {
        self.current == WorkerState::Running
    }

    pub fn is_deprecated(&self) -> bool {
        self.current == WorkerState::Deprecated
    }

    pub fn is_stopping(&self) -> bool {
        self.current == WorkerState::Stopping
    }

    pub fn is_stopped(&self) -> bool {
        self.current == WorkerState::Stopped
    }
}

impl Default for WorkerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
