//! Flow compilation
//!
//! Turns a [`Flow`] into the statements that register it with a Postgres
//! backed store, and into a serializable [`FlowShape`] for stores that keep
//! their own copy of the DAG.

use super::{Flow, RuntimeOptions, Slug};
use serde::{Deserialize, Serialize};

/// Handler-free description of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowShape {
    pub slug: Slug,
    #[serde(default)]
    pub options: RuntimeOptions,
    /// Steps in insertion order.
    pub steps: Vec<StepShape>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepShape {
    pub slug: Slug,
    #[serde(default)]
    pub dependencies: Vec<Slug>,
    #[serde(default)]
    pub options: RuntimeOptions,
}

impl FlowShape {
    pub fn of(flow: &Flow) -> Self {
        Self {
            slug: flow.slug().clone(),
            options: *flow.options(),
            steps: flow
                .steps_in_order()
                .map(|step| StepShape {
                    slug: step.slug().clone(),
                    dependencies: step.dependencies().to_vec(),
                    options: *step.options(),
                })
                .collect(),
        }
    }

    pub fn step(&self, slug: &str) -> Option<&StepShape> {
        self.steps.iter().find(|step| step.slug.as_str() == slug)
    }

    /// Steps that list `slug` as a dependency, in insertion order.
    pub fn dependents<'a>(&'a self, slug: &'a str) -> impl Iterator<Item = &'a StepShape> + 'a {
        self.steps
            .iter()
            .filter(move |step| step.dependencies.iter().any(|dep| dep.as_str() == slug))
    }
}

impl From<&Flow> for FlowShape {
    fn from(flow: &Flow) -> Self {
        Self::of(flow)
    }
}

/// SQL statements that create `flow` and its steps, in insertion order.
///
/// ```
/// use drover::graph::{compile_flow, Flow, StepOptions};
/// use drover::core::{BoxError, StepContext};
/// use serde_json::Value;
///
/// async fn noop(input: Value, _ctx: StepContext) -> Result<Value, BoxError> { Ok(input) }
///
/// let flow = Flow::new("etl").unwrap()
///     .step(StepOptions::new("extract").max_attempts(5), noop).unwrap()
///     .step(StepOptions::new("load").depends_on(["extract"]), noop).unwrap();
///
/// assert_eq!(compile_flow(&flow), vec![
///     "SELECT pgflow.create_flow('etl');",
///     "SELECT pgflow.add_step('etl', 'extract', max_attempts => 5);",
///     "SELECT pgflow.add_step('etl', 'load', ARRAY['extract']);",
/// ]);
/// ```
pub fn compile_flow(flow: &Flow) -> Vec<String> {
    let shape = FlowShape::of(flow);
    let flow_slug = quote(shape.slug.as_str());

    let mut statements = Vec::with_capacity(shape.steps.len() + 1);
    statements.push(format!(
        "SELECT pgflow.create_flow({flow_slug}{});",
        format_options(&shape.options)
    ));

    for step in &shape.steps {
        let deps = if step.dependencies.is_empty() {
            String::new()
        } else {
            let list: Vec<String> = step.dependencies.iter().map(|d| quote(d.as_str())).collect();
            format!(", ARRAY[{}]", list.join(", "))
        };
        statements.push(format!(
            "SELECT pgflow.add_step({flow_slug}, {}{deps}{});",
            quote(step.slug.as_str()),
            format_options(&step.options)
        ));
    }
    statements
}

fn format_options(options: &RuntimeOptions) -> String {
    let mut parts = Vec::new();
    if let Some(n) = options.max_attempts {
        parts.push(format!("max_attempts => {n}"));
    }
    if let Some(n) = options.base_delay {
        parts.push(format!("base_delay => {n}"));
    }
    if let Some(n) = options.timeout {
        parts.push(format!("timeout => {n}"));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(", {}", parts.join(", "))
    }
}

// Slugs may contain quotes.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BoxError, StepContext};
    use crate::graph::StepOptions;
    use serde_json::Value;

    async fn noop(input: Value, _ctx: StepContext) -> Result<Value, BoxError> {
        Ok(input)
    }

    #[test]
    fn test_flow_options_in_create_statement() {
        let flow = Flow::with_options(
            "f",
            RuntimeOptions::default().max_attempts(3).base_delay(2).timeout(10),
        )
        .unwrap();
        assert_eq!(
            compile_flow(&flow),
            vec!["SELECT pgflow.create_flow('f', max_attempts => 3, base_delay => 2, timeout => 10);"]
        );
    }

    #[test]
    fn test_dependencies_and_options_together() {
        let flow = Flow::new("f")
            .unwrap()
            .step("a", noop)
            .unwrap()
            .step("b", noop)
            .unwrap()
            .step(
                StepOptions::new("c").depends_on(["a", "b"]).timeout(30),
                noop,
            )
            .unwrap();
        let sql = compile_flow(&flow);
        assert_eq!(sql.len(), 4);
        assert_eq!(
            sql[3],
            "SELECT pgflow.add_step('f', 'c', ARRAY['a', 'b'], timeout => 30);"
        );
    }

    #[test]
    fn test_quotes_are_escaped() {
        let flow = Flow::new("it's").unwrap();
        assert_eq!(compile_flow(&flow)[0], "SELECT pgflow.create_flow('it''s');");
    }

    #[test]
    fn test_shape_preserves_order_and_serializes() {
        let flow = Flow::new("f")
            .unwrap()
            .step("a", noop)
            .unwrap()
            .step(StepOptions::new("b").depends_on(["a"]), noop)
            .unwrap();
        let shape = FlowShape::of(&flow);
        assert_eq!(shape.steps[1].dependencies, vec![Slug::new("a").unwrap()]);
        assert_eq!(shape.dependents("a").count(), 1);

        let json = serde_json::to_value(&shape).unwrap();
        let back: FlowShape = serde_json::from_value(json).unwrap();
        assert_eq!(back, shape);
    }
}
