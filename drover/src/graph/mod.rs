//! Flow definitions
//!
//! This module provides the DSL for declaring flows: named DAGs of steps whose
//! handlers receive the flow input plus the outputs of their dependencies.
//!
//! - [`Slug`]: validated identifiers for flows and steps
//! - [`Flow`]: immutable, append-only step registry; acyclic by construction
//! - [`StepInput`] / [`StepPayload`]: typed and dynamic views of a step's input
//! - [`compile_flow`] / [`FlowShape`]: handler-free renderings for stores
//!
//! # Design Principles
//!
//! A dependency must name a step that was added earlier, so there is no cycle
//! detection pass and no topological sort: insertion order is the order steps
//! become runnable in a serial execution.

mod compile;
mod error;
mod flow;
mod input;
mod slug;

pub use compile::{compile_flow, FlowShape, StepShape};
pub use error::{FlowError, FlowResult};
pub use flow::{
    Flow, RuntimeOptions, StepDefinition, StepFuture, StepOptions, DEFAULT_BASE_DELAY,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT,
};
pub use input::{StepInput, StepPayload, RUN_KEY};
pub use slug::{Slug, SlugError, MAX_SLUG_LENGTH};
