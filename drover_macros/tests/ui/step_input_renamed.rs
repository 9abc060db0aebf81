use drover::graph::StepInput;
use serde::Deserialize;

#[derive(Deserialize, drover::StepInput)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Notify {
    run: serde_json::Value,
    lookup_user: u64,
    #[serde(rename = "render-email")]
    body: String,
    #[serde(skip, default)]
    attempts: u32,
}

#[derive(Deserialize, drover::StepInput)]
struct Root {
    #[serde(rename = "run")]
    input: String,
}

fn main() {
    assert_eq!(
        Notify::dependency_slugs(),
        Some(&["lookupUser", "render-email"][..])
    );
    assert_eq!(Root::dependency_slugs(), Some(&[][..]));

    let notify: Notify = serde_json::from_value(serde_json::json!({
        "run": null,
        "lookupUser": 7,
        "render-email": "hi"
    }))
    .unwrap();
    assert_eq!(notify.lookup_user, 7);
    assert_eq!(notify.body, "hi");
    assert_eq!(notify.attempts, 0);
    let _ = notify.run;

    let root: Root = serde_json::from_value(serde_json::json!({"run": "x"})).unwrap();
    assert_eq!(root.input, "x");
}
