//! Step input shapes
//!
//! Every step receives one JSON object: the flow's input under `run` plus one
//! key per declared dependency holding that dependency's output. A step that
//! depends on nothing receives exactly `{"run": ...}`.
//!
//! Handlers pick how they see that object through [`StepInput`]:
//! - a struct deriving `StepInput` (fields `run` plus one per dependency),
//!   checked against the step's `depends_on` when the step is added
//! - [`StepPayload`] for dynamic access by slug
//! - a raw [`serde_json::Value`]

use crate::core::BoxError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key under which the flow input appears in every step input.
pub const RUN_KEY: &str = "run";

/// A type a step handler can receive as its input.
///
/// Implemented by `#[derive(StepInput)]`, which reports the non-`run` fields
/// (after serde renames) as the expected dependency slugs.
///
/// ```
/// use drover::StepInput;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, StepInput)]
/// struct SendInput {
///     run: String,
///     render: String,
///     #[serde(rename = "lookup-user")]
///     user: u64,
/// }
///
/// assert_eq!(
///     <SendInput as drover::graph::StepInput>::dependency_slugs(),
///     Some(&["render", "lookup-user"][..])
/// );
/// ```
pub trait StepInput: DeserializeOwned + Send + 'static {
    /// Dependency slugs this type expects, or `None` when it accepts any set.
    fn dependency_slugs() -> Option<&'static [&'static str]>;
}

impl StepInput for Value {
    fn dependency_slugs() -> Option<&'static [&'static str]> {
        None
    }
}

/// Dynamically typed step input.
///
/// ```
/// use drover::graph::StepPayload;
/// use serde_json::json;
///
/// let payload: StepPayload =
///     serde_json::from_value(json!({"run": {"id": 3}, "fetch": "body"})).unwrap();
/// assert_eq!(payload.run_value(), &json!({"id": 3}));
/// let body: String = payload.dep("fetch").unwrap();
/// assert_eq!(body, "body");
/// assert!(payload.dep::<String>("missing").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct StepPayload {
    run: Value,
    deps: BTreeMap<String, Value>,
}

impl StepPayload {
    pub fn new(run: Value) -> Self {
        Self {
            run,
            deps: BTreeMap::new(),
        }
    }

    pub fn with_dep(mut self, slug: impl Into<String>, output: Value) -> Self {
        self.deps.insert(slug.into(), output);
        self
    }

    pub fn run_value(&self) -> &Value {
        &self.run
    }

    /// Deserializes the flow input.
    pub fn run<T: DeserializeOwned>(&self) -> Result<T, BoxError> {
        Ok(serde_json::from_value(self.run.clone())?)
    }

    pub fn dep_value(&self, slug: &str) -> Option<&Value> {
        self.deps.get(slug)
    }

    /// Deserializes the output of dependency `slug`.
    pub fn dep<T: DeserializeOwned>(&self, slug: &str) -> Result<T, BoxError> {
        let value = self
            .deps
            .get(slug)
            .ok_or_else(|| format!("no output for dependency \"{slug}\""))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Dependency slugs present, in lexical order.
    pub fn dep_slugs(&self) -> impl Iterator<Item = &str> {
        self.deps.keys().map(String::as_str)
    }
}

impl StepInput for StepPayload {
    fn dependency_slugs() -> Option<&'static [&'static str]> {
        None
    }
}

impl TryFrom<Map<String, Value>> for StepPayload {
    type Error = String;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        let run = map
            .remove(RUN_KEY)
            .ok_or_else(|| format!("step input is missing the \"{RUN_KEY}\" key"))?;
        Ok(Self {
            run,
            deps: map.into_iter().collect(),
        })
    }
}

impl From<StepPayload> for Map<String, Value> {
    fn from(payload: StepPayload) -> Self {
        let mut map: Map<String, Value> = payload.deps.into_iter().collect();
        map.insert(RUN_KEY.to_string(), payload.run);
        map
    }
}

/// Checks that `input` has exactly the keys `run` plus `dependencies`.
pub(crate) fn check_shape(input: &Value, dependencies: &[&str]) -> Result<(), String> {
    let Value::Object(map) = input else {
        return Err(format!("expected a JSON object, got {}", json_kind(input)));
    };
    if !map.contains_key(RUN_KEY) {
        return Err(format!("missing key \"{RUN_KEY}\""));
    }
    if let Some(missing) = dependencies.iter().find(|dep| !map.contains_key(**dep)) {
        return Err(format!("missing key \"{missing}\""));
    }
    if let Some(extra) = map
        .keys()
        .find(|key| key.as_str() != RUN_KEY && !dependencies.contains(&key.as_str()))
    {
        return Err(format!("unexpected key \"{extra}\""));
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
