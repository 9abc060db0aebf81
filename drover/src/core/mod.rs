//! Core building blocks shared by the flow DSL and the workers.
//!
//! # Retry Behavior
//! - [`RetryConfig`]: fixed or exponential rescheduling of failed executions
//! - [`RetryConfig::should_retry`]: the `read_count < limit + 1` decision
//!
//! # Handler Errors
//! - [`BoxError`]: the error type every handler returns
//! - [`JsonError`] and [`error_message`]: coercion of failures into stored messages
//!
//! # Contexts
//! - [`StepContext`] and [`MessageContext`]: per-execution metadata plus the
//!   worker's cancellation signal

mod context;
mod error;
pub mod retry;

pub use context::{MessageContext, StepContext};
pub use error::{error_message, BoxError, JsonError};
pub use retry::{InvalidRetryConfig, RetryConfig};
