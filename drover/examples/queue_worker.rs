//! Queue worker demonstration
//!
//! A worker serving an `emails` queue with exponential retries. A few
//! messages fail twice before going through; the one addressed to
//! `bounce@example.com` always fails and is archived once its retries run
//! out. Ctrl-C stops the worker: in-flight handlers are abandoned and their
//! messages redelivered after the visibility timeout.
//!
//! Run with `cargo run --example queue_worker`.

use drover::prelude::*;
use drover::storage::StoreOp;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct Email {
    to: String,
    subject: String,
    #[serde(default)]
    flaky: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Arc::new(InMemoryStore::new());
    for i in 0..9 {
        store.send(
            "emails",
            json!({
                "to": format!("user{i}@example.com"),
                "subject": format!("Issue #{i}"),
                "flaky": i % 3 == 0,
            }),
        );
    }
    store.send(
        "emails",
        json!({"to": "bounce@example.com", "subject": "Never arrives"}),
    );

    let failures: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
    let config = QueueWorkerConfig::default()
        .with_worker(
            WorkerConfig::default()
                .with_queue_name("emails")
                .with_max_concurrent(3)
                .with_max_poll_seconds(1),
        )
        .with_retry(RetryConfig::exponential(3, 1, 4))
        .with_archive_batch_size(5);

    let worker = create_queue_worker(
        move |email: Email, ctx: MessageContext| {
            let failures = failures.clone();
            async move {
                let failed = {
                    let mut seen = failures.lock().expect("failure map poisoned");
                    let count = seen.entry(email.to.clone()).or_insert(0);
                    let fail = email.to.starts_with("bounce") || (email.flaky && *count < 2);
                    if fail {
                        *count += 1;
                    }
                    fail
                };
                if failed {
                    warn!(to = %email.to, read_count = ctx.read_count, "delivery failed");
                    return Err::<(), BoxError>(format!("could not deliver to {}", email.to).into());
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                info!(to = %email.to, subject = %email.subject, "delivered");
                Ok(())
            }
        },
        config,
        store.clone(),
    )?;

    worker.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = async {
            while store.queue_len("emails") > 0 {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        } => info!("queue drained"),
    }

    worker.stop().await?;
    info!(
        archived = store.archived_ids("emails").len(),
        batches = store.call_count(StoreOp::ArchiveBatch),
        retries = store.call_count(StoreOp::SetVisibility),
        "done"
    );
    Ok(())
}
