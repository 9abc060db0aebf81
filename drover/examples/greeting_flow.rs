//! Greeting flow demonstration
//!
//! A four-step flow run by two workers sharing one in-memory store:
//!
//! ```text
//!            +-> greeting --+
//! lookup ----|              +--> render
//!            +-> farewell --+
//! ```
//!
//! `render` takes a typed input (`#[derive(StepInput)]`); the others use the
//! dynamic `StepPayload`. The SQL a Postgres deployment would install for
//! the flow is printed first.
//!
//! Run with `cargo run --example greeting_flow`, adding `RUST_LOG=debug` for
//! the worker's own logs.

use drover::compile_flow;
use drover::prelude::*;
use drover::storage::RunStatus;
use serde_json::json;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize, StepInput)]
struct RenderInput {
    run: serde_json::Value,
    greeting: String,
    farewell: String,
}

fn build_flow() -> Result<Flow, FlowError> {
    Flow::with_options("greeting", RuntimeOptions::default().max_attempts(2))?
        .step("lookup", |input: StepPayload, _ctx: StepContext| async move {
            let user_id = input.run_value()["user_id"].as_u64().unwrap_or_default();
            match user_id {
                1 => Ok("Ada".to_string()),
                2 => Ok("Grace".to_string()),
                _ => Err::<String, BoxError>(format!("unknown user {user_id}").into()),
            }
        })?
        .step(
            StepOptions::new("greeting").depends_on(["lookup"]),
            |input: StepPayload, _ctx: StepContext| async move {
                let name: String = input.dep("lookup")?;
                Ok::<_, BoxError>(format!("Hello, {name}!"))
            },
        )?
        .step(
            StepOptions::new("farewell").depends_on(["lookup"]),
            |input: StepPayload, _ctx: StepContext| async move {
                let name: String = input.dep("lookup")?;
                Ok::<_, BoxError>(format!("Goodbye, {name}."))
            },
        )?
        .step(
            StepOptions::new("render")
                .depends_on(["greeting", "farewell"])
                .timeout(10),
            |input: RenderInput, ctx: StepContext| async move {
                info!(run_id = %ctx.run_id, attempt = ctx.attempt, "rendering");
                Ok::<_, BoxError>(json!({
                    "text": format!("{} ... {}", input.greeting, input.farewell),
                    "user": input.run["user_id"],
                }))
            },
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let flow = build_flow()?;
    for statement in compile_flow(&flow) {
        println!("{statement}");
    }

    let store = Arc::new(InMemoryStore::new());
    store.register_flow(&flow);

    let config = FlowWorkerConfig::default().with_worker(
        WorkerConfig::default()
            .with_max_concurrent(4)
            .with_max_poll_seconds(1),
    );
    let workers = [
        create_flow_worker(flow.clone(), config.clone(), store.clone())?,
        create_flow_worker(flow, config, store.clone())?,
    ];
    for worker in &workers {
        worker.start().await?;
    }

    let runs = [
        store.start_flow("greeting", json!({"user_id": 1}))?,
        store.start_flow("greeting", json!({"user_id": 2}))?,
        store.start_flow("greeting", json!({"user_id": 99}))?,
    ];
    for run_id in runs {
        match store.wait_for_run(run_id, Duration::from_secs(30)).await {
            Some(run) if run.status == RunStatus::Completed => {
                info!(%run_id, output = %run.output.unwrap_or_default(), "run completed");
            }
            Some(run) => {
                let reason = run
                    .steps
                    .values()
                    .find_map(|step| step.error_message.clone());
                info!(%run_id, status = %run.status, reason = ?reason, "run did not complete");
            }
            None => info!(%run_id, "run still in progress"),
        }
    }

    for worker in &workers {
        worker.stop().await?;
    }
    Ok(())
}
