use drover::core::{BoxError, StepContext};
use drover::graph::{Flow, StepInput, StepOptions};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize, drover::StepInput)]
struct Summarize {
    run: Value,
    fetch: String,
}

fn main() {
    assert_eq!(Summarize::dependency_slugs(), Some(&["fetch"][..]));

    let flow = Flow::new("pages")
        .unwrap()
        .step("fetch", |_: Value, _ctx: StepContext| async {
            Ok::<_, BoxError>("<html>")
        })
        .unwrap()
        .step(
            StepOptions::new("summarize").depends_on(["fetch"]),
            |input: Summarize, _ctx: StepContext| async move {
                let _ = input.run;
                Ok::<_, BoxError>(input.fetch.len())
            },
        )
        .unwrap();
    assert_eq!(flow.len(), 2);

    // Declared dependencies must match the input type's fields.
    let mismatch = Flow::new("pages").unwrap().step(
        "summarize",
        |input: Summarize, _ctx: StepContext| async move { Ok::<_, BoxError>(input.fetch) },
    );
    assert!(mismatch.is_err());
}
