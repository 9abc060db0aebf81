//! Worker machinery: leasing, bounded execution, retries and the lifecycle.
//!
//! A worker is assembled bottom-up:
//!
//! - a [`Poller`] leases batches from the store ([`MessagePoller`] for plain
//!   queues, [`StepTaskPoller`] for flow step tasks)
//! - an [`ExecutorFactory`] turns each leased item into a [`TaskExecutor`]
//!   that runs the handler once and settles the item
//! - the [`ExecutionController`] bounds how many executions run at once
//! - the [`BatchProcessor`] connects the three and drains them on stop
//! - the [`Worker`] drives the loop through its [`WorkerLifecycle`]
//!
//! [`create_queue_worker`] and [`create_flow_worker`] do the assembly.

mod archiver;
mod batch;
mod controller;
mod error;
mod execution;
mod flow_worker;
mod heartbeat;
mod lifecycle;
mod message;
mod poller;
mod queue_worker;
mod state;
mod step_task;
mod worker;

pub use archiver::BatchArchiver;
pub use batch::{BatchProcessing, BatchProcessor};
pub use controller::ExecutionController;
pub use error::{ExecutionError, Result};
pub use execution::{ExecutionOutcome, ExecutorFactory, TaskExecutor};
pub use flow_worker::create_flow_worker;
pub use heartbeat::Heartbeat;
pub use lifecycle::{WorkerBootstrap, WorkerLifecycle};
pub use message::{
    boxed_message_handler, BoxedMessageHandler, MessageExecutor, MessageExecutorFactory,
    MessageFuture,
};
pub use poller::{MessagePoller, Poller, StepTaskPoller};
pub use queue_worker::create_queue_worker;
pub use state::{TransitionError, WorkerState, WorkerStateMachine};
pub use step_task::{StepTaskExecutor, StepTaskExecutorFactory};
pub use worker::Worker;
