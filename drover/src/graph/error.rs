//! Error types for flow definitions
//!
//! Every variant is raised while a [`Flow`](super::Flow) is being built or
//! inspected, so none of them can surface once a worker is running a
//! definition it accepted.

use super::SlugError;
use thiserror::Error;

/// Result type for flow definition operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors that can occur while defining or inspecting a flow
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FlowError {
    /// A runtime option is out of range
    #[error("{rule}")]
    Validation {
        /// The rule that was violated
        rule: String,
    },

    /// A flow or step slug failed validation
    #[error("invalid slug \"{slug}\": {reason}")]
    InvalidSlug { slug: String, reason: SlugError },

    /// A step slug is already registered in this flow
    #[error("Step \"{step}\" is already defined in flow \"{flow}\"")]
    DuplicateStep { flow: String, step: String },

    /// A step lists a dependency that has not been added yet
    #[error("Step \"{step}\" depends on undefined step \"{dependency}\"")]
    UnknownDependency { step: String, dependency: String },

    /// A lookup named a step the flow does not contain
    #[error("Step \"{step}\" does not exist in flow \"{flow}\"")]
    StepNotFound { flow: String, step: String },

    /// A step input does not match the step's dependency list
    #[error("input for step \"{step}\" does not match its dependencies: {reason}")]
    InputShape { step: String, reason: String },
}

impl FlowError {
    pub fn validation(rule: impl Into<String>) -> Self {
        Self::Validation { rule: rule.into() }
    }

    pub fn invalid_slug(slug: impl Into<String>, reason: SlugError) -> Self {
        Self::InvalidSlug {
            slug: slug.into(),
            reason,
        }
    }

    pub fn unknown_dependency(step: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::UnknownDependency {
            step: step.into(),
            dependency: dependency.into(),
        }
    }

    pub fn step_not_found(flow: impl Into<String>, step: impl Into<String>) -> Self {
        Self::StepNotFound {
            flow: flow.into(),
            step: step.into(),
        }
    }

    pub fn input_shape(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InputShape {
            step: step.into(),
            reason: reason.into(),
        }
    }
}
