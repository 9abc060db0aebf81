//! Drover: durable flow and queue workers for Rust
//!
//! `drover` runs two kinds of background work against a transactional queue
//! store:
//!
//! - **Flows**: named DAGs of steps. Each step declares the steps it depends
//!   on and receives the flow input plus their outputs. The store creates a
//!   step's task once its dependencies complete; a flow worker leases those
//!   tasks, runs the handlers and reports the results back.
//! - **Queues**: plain message queues served by a single handler, with
//!   fixed or exponential retries and batched archiving.
//!
//! Work is leased, never locked: a message stays invisible to other workers
//! for its visibility timeout, and a worker that dies or shuts down mid-task
//! simply lets the lease expire so the item is redelivered.
//!
//! # Quick Start
//!
//! ```no_run
//! use drover::prelude::*;
//! use serde_json::json;
//!
//! #[derive(Deserialize, StepInput)]
//! struct ShoutInput {
//!     run: serde_json::Value,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let flow = Flow::new("greet")?
//!         .step("name", |input: StepPayload, _ctx: StepContext| async move {
//!             Ok::<_, BoxError>(input.run_value()["name"].clone())
//!         })?
//!         .step(
//!             StepOptions::new("shout").depends_on(["name"]),
//!             |input: ShoutInput, _ctx: StepContext| async move {
//!                 Ok::<_, BoxError>(input.name.to_uppercase())
//!             },
//!         )?;
//!
//!     let store = Arc::new(InMemoryStore::new());
//!     store.register_flow(&flow);
//!     let run_id = store.start_flow("greet", json!({"name": "ada"}))?;
//!
//!     let worker = create_flow_worker(flow, FlowWorkerConfig::default(), store.clone())?;
//!     worker.start().await?;
//!     let run = store.wait_for_run(run_id, std::time::Duration::from_secs(5)).await;
//!     println!("{:?}", run.and_then(|run| run.output));
//!     worker.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`graph`]: the flow DSL (slugs, steps, dependency checks, compilation)
//! - [`executor`]: pollers, executors, the execution controller and workers
//! - [`storage`]: the [`Store`](storage::Store) trait and its backends
//! - [`core`]: retry policies, handler contexts and handler errors
//! - [`config`]: worker settings

// Lets `#[derive(StepInput)]` expand to `::drover::...` inside this crate too
extern crate self as drover;

pub mod config;
pub mod core;
pub mod executor;
pub mod graph;
pub mod storage;

pub use config::{ConfigError, FlowWorkerConfig, QueueWorkerConfig, WorkerConfig};

pub use core::{error_message, BoxError, JsonError, MessageContext, RetryConfig, StepContext};

pub use executor::{
    create_flow_worker, create_queue_worker, ExecutionError, ExecutionOutcome,
    Result as ExecutionResult, Worker, WorkerBootstrap, WorkerState,
};

pub use graph::{
    compile_flow, Flow, FlowError, FlowResult, FlowShape, RuntimeOptions, Slug, SlugError,
    StepDefinition, StepInput, StepOptions, StepPayload,
};

pub use storage::{InMemoryStore, Result as StorageResult, StorageError, Store};

#[cfg(feature = "postgres")]
pub use storage::PostgresStore;

pub use drover_macros::StepInput;

// Re-export dependencies used in the public API
pub use serde;
pub use serde_json;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use drover::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{FlowWorkerConfig, QueueWorkerConfig, WorkerConfig};

    pub use crate::core::{BoxError, JsonError, MessageContext, RetryConfig, StepContext};

    pub use crate::executor::{
        create_flow_worker, create_queue_worker, ExecutionError, Worker, WorkerState,
    };

    pub use crate::graph::{Flow, FlowError, RuntimeOptions, StepInput, StepOptions, StepPayload};

    pub use crate::storage::{InMemoryStore, Store};

    pub use drover_macros::StepInput;

    // Re-export commonly used external types
    pub use serde::{Deserialize, Serialize};
    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
