//! Flow - an immutable, append-only DAG of steps
//!
//! A [`Flow`] is built one step at a time. Each call to [`Flow::step`]
//! returns a new flow and leaves the receiver untouched, and a step may only
//! depend on steps that already exist, so every flow is acyclic by
//! construction and its insertion order is already a topological order.
//!
//! Step handlers are type-erased when they are added: the typed input is
//! deserialized from the step's JSON input and the typed output serialized
//! back, so a worker only ever sees `Value -> Value` handlers.

use super::error::{FlowError, FlowResult};
use super::input::{check_shape, StepInput, RUN_KEY};
use super::Slug;
use crate::core::retry::MAX_DELAY_SECONDS;
use crate::core::{BoxError, RetryConfig, StepContext};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Attempts per step when neither the step nor its flow sets `max_attempts`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Base retry delay in seconds when neither the step nor its flow sets one.
pub const DEFAULT_BASE_DELAY: u32 = 1;
/// Task timeout in seconds when neither the step nor its flow sets one.
pub const DEFAULT_TIMEOUT: u32 = 60;

/// Future returned by a type-erased step handler.
pub type StepFuture = BoxFuture<'static, Result<Value, BoxError>>;

type BoxedStepHandler = Arc<dyn Fn(Value, StepContext) -> StepFuture + Send + Sync>;

/// Retry and timeout settings for a flow or one of its steps.
///
/// Unset fields fall back from the step to its flow, then to the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<u32>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

impl RuntimeOptions {
    pub fn max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = Some(value);
        self
    }

    pub fn base_delay(mut self, seconds: u32) -> Self {
        self.base_delay = Some(seconds);
        self
    }

    pub fn timeout(mut self, seconds: u32) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn validate(&self) -> FlowResult<()> {
        if matches!(self.max_attempts, Some(n) if n < 1) {
            return Err(FlowError::validation(
                "max_attempts must be greater than or equal to 1",
            ));
        }
        if matches!(self.base_delay, Some(n) if n < 1) {
            return Err(FlowError::validation(
                "base_delay must be greater than or equal to 1",
            ));
        }
        if matches!(self.timeout, Some(n) if n < 3) {
            return Err(FlowError::validation(
                "timeout must be greater than or equal to 3",
            ));
        }
        Ok(())
    }

    /// Fills unset fields from `fallback`.
    pub fn or(self, fallback: RuntimeOptions) -> Self {
        Self {
            max_attempts: self.max_attempts.or(fallback.max_attempts),
            base_delay: self.base_delay.or(fallback.base_delay),
            timeout: self.timeout.or(fallback.timeout),
        }
    }
}

/// Declaration of a step: its slug, dependencies and runtime options.
///
/// A bare `&str` converts into options for a root step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOptions {
    slug: String,
    depends_on: Vec<String>,
    options: RuntimeOptions,
}

impl StepOptions {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            depends_on: Vec::new(),
            options: RuntimeOptions::default(),
        }
    }

    pub fn depends_on<I, S>(mut self, slugs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(slugs.into_iter().map(Into::into));
        self
    }

    pub fn max_attempts(mut self, value: u32) -> Self {
        self.options = self.options.max_attempts(value);
        self
    }

    pub fn base_delay(mut self, seconds: u32) -> Self {
        self.options = self.options.base_delay(seconds);
        self
    }

    pub fn timeout(mut self, seconds: u32) -> Self {
        self.options = self.options.timeout(seconds);
        self
    }
}

impl From<&str> for StepOptions {
    fn from(slug: &str) -> Self {
        Self::new(slug)
    }
}

impl From<String> for StepOptions {
    fn from(slug: String) -> Self {
        Self::new(slug)
    }
}

/// A registered step.
pub struct StepDefinition {
    slug: Slug,
    dependencies: Vec<Slug>,
    options: RuntimeOptions,
    handler: BoxedStepHandler,
}

impl StepDefinition {
    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    /// Dependencies in declaration order.
    pub fn dependencies(&self) -> &[Slug] {
        &self.dependencies
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Runs the handler after checking `input` has exactly the keys `run`
    /// plus this step's dependencies.
    pub async fn invoke(&self, input: Value, ctx: StepContext) -> Result<Value, BoxError> {
        let expected: Vec<&str> = self.dependencies.iter().map(Slug::as_str).collect();
        check_shape(&input, &expected)
            .map_err(|reason| FlowError::input_shape(self.slug.as_str(), reason))?;
        (self.handler)(input, ctx).await
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("slug", &self.slug)
            .field("dependencies", &self.dependencies)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A flow definition.
///
/// # Example
///
/// ```
/// use drover::graph::{Flow, StepOptions, StepPayload};
/// use drover::core::{BoxError, StepContext};
/// use serde_json::json;
///
/// let flow = Flow::new("greet").unwrap()
///     .step("name", |input: StepPayload, _ctx: StepContext| async move {
///         Ok::<_, BoxError>(input.run_value()["name"].clone())
///     }).unwrap()
///     .step(StepOptions::new("shout").depends_on(["name"]),
///         |input: StepPayload, _ctx: StepContext| async move {
///             let name: String = input.dep("name")?;
///             Ok::<_, BoxError>(json!(name.to_uppercase()))
///         }).unwrap();
///
/// let order: Vec<&str> = flow.steps_in_order().map(|s| s.slug().as_str()).collect();
/// assert_eq!(order, ["name", "shout"]);
/// ```
#[derive(Clone)]
pub struct Flow {
    slug: Slug,
    options: RuntimeOptions,
    steps: HashMap<Slug, Arc<StepDefinition>>,
    /// Insertion order, which is also a valid topological order
    step_order: Vec<Slug>,
}

impl Flow {
    pub fn new(slug: &str) -> FlowResult<Self> {
        Self::with_options(slug, RuntimeOptions::default())
    }

    pub fn with_options(slug: &str, options: RuntimeOptions) -> FlowResult<Self> {
        let slug = Slug::new(slug).map_err(|reason| FlowError::invalid_slug(slug, reason))?;
        options.validate()?;
        Ok(Self {
            slug,
            options,
            steps: HashMap::new(),
            step_order: Vec::new(),
        })
    }

    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Returns a new flow with one more step; `self` is left unchanged.
    ///
    /// Fails if the slug is invalid or taken, a dependency is not yet
    /// defined, an option is out of range, or `I` expects a different set of
    /// dependencies than the step declares.
    pub fn step<I, F, Fut, O, E>(&self, step: impl Into<StepOptions>, handler: F) -> FlowResult<Flow>
    where
        I: StepInput,
        F: Fn(I, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        O: Serialize,
        E: Into<BoxError>,
    {
        let StepOptions {
            slug,
            depends_on,
            options,
        } = step.into();

        let step_slug =
            Slug::new(slug.as_str()).map_err(|reason| FlowError::invalid_slug(&slug, reason))?;
        if step_slug.as_str() == RUN_KEY {
            return Err(FlowError::validation(format!(
                "step slug \"{RUN_KEY}\" is reserved for the flow input"
            )));
        }
        if self.steps.contains_key(&step_slug) {
            return Err(FlowError::DuplicateStep {
                flow: self.slug.to_string(),
                step: slug,
            });
        }

        let mut dependencies: Vec<Slug> = Vec::with_capacity(depends_on.len());
        for dep in &depends_on {
            let Some(existing) = self.steps.get(dep.as_str()) else {
                return Err(FlowError::unknown_dependency(&slug, dep));
            };
            if !dependencies.contains(existing.slug()) {
                dependencies.push(existing.slug().clone());
            }
        }

        options.validate()?;

        if let Some(expected) = I::dependency_slugs() {
            let expected: HashSet<&str> = expected.iter().copied().collect();
            let declared: HashSet<&str> = dependencies.iter().map(Slug::as_str).collect();
            if expected != declared {
                let mut expected: Vec<&str> = expected.into_iter().collect();
                let mut declared: Vec<&str> = declared.into_iter().collect();
                expected.sort_unstable();
                declared.sort_unstable();
                return Err(FlowError::input_shape(
                    &slug,
                    format!("input type expects {expected:?} but the step depends on {declared:?}"),
                ));
            }
        }

        let handler = Arc::new(handler);
        let boxed: BoxedStepHandler = Arc::new(move |input: Value, ctx: StepContext| {
            let handler = Arc::clone(&handler);
            async move {
                let input: I = serde_json::from_value(input)?;
                let output = handler(input, ctx).await.map_err(Into::into)?;
                Ok::<Value, BoxError>(serde_json::to_value(output)?)
            }
            .boxed()
        });

        let definition = StepDefinition {
            slug: step_slug.clone(),
            dependencies,
            options,
            handler: boxed,
        };

        let mut next = self.clone();
        next.steps.insert(step_slug.clone(), Arc::new(definition));
        next.step_order.push(step_slug);
        Ok(next)
    }

    pub fn get_step_definition(&self, slug: &str) -> FlowResult<&Arc<StepDefinition>> {
        self.steps
            .get(slug)
            .ok_or_else(|| FlowError::step_not_found(self.slug.as_str(), slug))
    }

    /// Steps in the order they were added.
    pub fn steps_in_order(&self) -> impl Iterator<Item = &StepDefinition> + '_ {
        self.step_order
            .iter()
            .filter_map(|slug| self.steps.get(slug).map(Arc::as_ref))
    }

    pub fn contains_step(&self, slug: &str) -> bool {
        self.steps.contains_key(slug)
    }

    pub fn len(&self) -> usize {
        self.step_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_order.is_empty()
    }

    /// Steps with no dependencies, in insertion order.
    pub fn root_steps(&self) -> Vec<&Slug> {
        self.steps_in_order()
            .filter(|step| step.dependencies.is_empty())
            .map(StepDefinition::slug)
            .collect()
    }

    /// Steps nothing depends on, in insertion order.
    pub fn leaf_steps(&self) -> Vec<&Slug> {
        self.step_order
            .iter()
            .filter(|slug| self.dependents(slug.as_str()).is_empty())
            .collect()
    }

    /// Steps that list `slug` as a dependency, in insertion order.
    pub fn dependents(&self, slug: &str) -> Vec<&Slug> {
        self.steps_in_order()
            .filter(|step| step.dependencies.iter().any(|dep| dep.as_str() == slug))
            .map(StepDefinition::slug)
            .collect()
    }

    /// Options for `step` after falling back to the flow's and the defaults.
    pub fn effective_options(&self, step: &StepDefinition) -> RuntimeOptions {
        step.options.or(self.options).or(RuntimeOptions {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            base_delay: Some(DEFAULT_BASE_DELAY),
            timeout: Some(DEFAULT_TIMEOUT),
        })
    }

    /// Retry schedule for a failing task of `step`.
    ///
    /// `max_attempts` counts the first attempt, so the retry limit is one
    /// less; delays double from `base_delay`.
    pub fn retry_config(&self, step: &StepDefinition) -> RetryConfig {
        let options = self.effective_options(step);
        let max_attempts = options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let base_delay = u64::from(options.base_delay.unwrap_or(DEFAULT_BASE_DELAY));
        RetryConfig::exponential(max_attempts.saturating_sub(1), base_delay, MAX_DELAY_SECONDS)
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("slug", &self.slug)
            .field("options", &self.options)
            .field("steps", &self.step_order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{SlugError, StepPayload};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn echo(input: Value, _ctx: StepContext) -> Result<Value, BoxError> {
        Ok(input)
    }

    fn ctx(step: &str) -> StepContext {
        StepContext::new("test", uuid::Uuid::nil(), step, 1, CancellationToken::new())
    }

    fn diamond() -> Flow {
        Flow::new("diamond")
            .unwrap()
            .step("a", echo)
            .unwrap()
            .step(StepOptions::new("b").depends_on(["a"]), echo)
            .unwrap()
            .step(StepOptions::new("c").depends_on(["a"]), echo)
            .unwrap()
            .step(StepOptions::new("d").depends_on(["b", "c"]), echo)
            .unwrap()
    }

    #[test]
    fn test_empty_flow() {
        let flow = Flow::new("empty").unwrap();
        assert!(flow.is_empty());
        assert_eq!(flow.steps_in_order().count(), 0);
    }

    #[test]
    fn test_invalid_flow_slug() {
        let err = Flow::new("_flow").unwrap_err();
        assert_eq!(
            err,
            FlowError::invalid_slug("_flow", SlugError::LeadingUnderscore)
        );
    }

    #[test]
    fn test_flow_options_are_validated() {
        let err = Flow::with_options("f", RuntimeOptions::default().timeout(2)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "timeout must be greater than or equal to 3"
        );
        assert!(Flow::with_options("f", RuntimeOptions::default().max_attempts(0)).is_err());
        assert!(Flow::with_options("f", RuntimeOptions::default().base_delay(0)).is_err());
        assert!(Flow::with_options(
            "f",
            RuntimeOptions::default().max_attempts(1).base_delay(1).timeout(3)
        )
        .is_ok());
    }

    #[test]
    fn test_step_returns_new_flow() {
        let base = Flow::new("f").unwrap().step("a", echo).unwrap();
        let extended = base.step("b", echo).unwrap();
        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert!(!base.contains_step("b"));
    }

    #[test]
    fn test_insertion_order_and_topology() {
        let flow = diamond();
        let order: Vec<&str> = flow.steps_in_order().map(|s| s.slug().as_str()).collect();
        assert_eq!(order, ["a", "b", "c", "d"]);
        assert_eq!(flow.root_steps(), vec![&Slug::new("a").unwrap()]);
        assert_eq!(flow.leaf_steps(), vec![&Slug::new("d").unwrap()]);
        let dependents: Vec<&str> = flow.dependents("a").iter().map(|s| s.as_str()).collect();
        assert_eq!(dependents, ["b", "c"]);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = Flow::new("f")
            .unwrap()
            .step(StepOptions::new("b").depends_on(["a"]), echo)
            .unwrap_err();
        assert_eq!(err.to_string(), "Step \"b\" depends on undefined step \"a\"");
    }

    #[test]
    fn test_self_dependency_is_unknown() {
        let err = Flow::new("f")
            .unwrap()
            .step(StepOptions::new("a").depends_on(["a"]), echo)
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownDependency { .. }));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let flow = Flow::new("f").unwrap().step("a", echo).unwrap();
        let err = flow.step("a", echo).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateStep { .. }));
    }

    #[test]
    fn test_reserved_run_slug_rejected() {
        let err = Flow::new("f").unwrap().step("run", echo).unwrap_err();
        assert!(matches!(err, FlowError::Validation { .. }));
    }

    #[test]
    fn test_duplicate_dependencies_collapse() {
        let flow = Flow::new("f")
            .unwrap()
            .step("a", echo)
            .unwrap()
            .step(StepOptions::new("b").depends_on(["a", "a"]), echo)
            .unwrap();
        let b = flow.get_step_definition("b").unwrap();
        assert_eq!(b.dependencies().len(), 1);
    }

    #[test]
    fn test_step_options_validated() {
        let err = Flow::new("f")
            .unwrap()
            .step(StepOptions::new("a").max_attempts(0), echo)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "max_attempts must be greater than or equal to 1"
        );
    }

    #[test]
    fn test_get_step_definition_missing() {
        let err = diamond().get_step_definition("z").unwrap_err();
        assert_eq!(err.to_string(), "Step \"z\" does not exist in flow \"diamond\"");
    }

    #[test]
    fn test_effective_options_fall_back() {
        let flow = Flow::with_options("f", RuntimeOptions::default().base_delay(5))
            .unwrap()
            .step(StepOptions::new("a").max_attempts(4), echo)
            .unwrap();
        let a = flow.get_step_definition("a").unwrap();
        let options = flow.effective_options(a);
        assert_eq!(options.max_attempts, Some(4));
        assert_eq!(options.base_delay, Some(5));
        assert_eq!(options.timeout, Some(DEFAULT_TIMEOUT));

        let retry = flow.retry_config(a);
        assert_eq!(retry.limit(), 3);
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_invoke_checks_input_shape() {
        let flow = diamond();
        let d = flow.get_step_definition("d").unwrap();

        let ok = d
            .invoke(json!({"run": 1, "b": 2, "c": 3}), ctx("d"))
            .await
            .unwrap();
        assert_eq!(ok, json!({"run": 1, "b": 2, "c": 3}));

        let err = d.invoke(json!({"run": 1, "b": 2}), ctx("d")).await.unwrap_err();
        assert!(err.to_string().contains("missing key \"c\""));
    }

    #[tokio::test]
    async fn test_typed_handler_errors_propagate() {
        let flow = Flow::new("f")
            .unwrap()
            .step("a", |input: StepPayload, _ctx: StepContext| async move {
                let n: i64 = input.run()?;
                if n < 0 {
                    return Err::<i64, BoxError>("negative".into());
                }
                Ok(n * 2)
            })
            .unwrap();
        let a = flow.get_step_definition("a").unwrap();
        assert_eq!(a.invoke(json!({"run": 21}), ctx("a")).await.unwrap(), json!(42));
        assert_eq!(
            a.invoke(json!({"run": -1}), ctx("a")).await.unwrap_err().to_string(),
            "negative"
        );
    }
}
