//! Enqueues a few jobs, drains them with a polling worker and guards a
//! shared section with the distributed lock.
//!
//! Run against a local Redis: `LEASEQ_REDIS_DSN=redis://localhost:6379/0`.

use std::time::Duration;

use anyhow::{Context, Result};
use leaseq::{Coordinator, EnqueueOptions, FailOutcome, LockOptions, telemetry};
use leaseq_config::load_settings_or_default;
use serde_json::{Map, json};

const WORKER_ID: &str = "demo-worker-1";

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let settings = load_settings_or_default(None).context("failed to load leaseq settings")?;
    let coordinator = Coordinator::connect(settings)
        .await
        .context("failed to connect coordinator")?;
    let queue = coordinator.queue().clone();
    let queue_name = queue.default_queue().to_string();

    for (index, priority) in [1, 5, 3].into_iter().enumerate() {
        let mut payload = Map::new();
        payload.insert("report_id".to_string(), json!(index));
        let job_id = queue
            .enqueue_default(
                "export_report",
                payload,
                EnqueueOptions {
                    priority: Some(priority),
                    max_retries: Some(2),
                    timeout_seconds: Some(30),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(job_id = %job_id, priority, "enqueued demo job");
    }

    queue.register_worker(WORKER_ID, &[queue_name.as_str()]).await?;
    let locks = coordinator.locks().clone();

    loop {
        let Some(job) = queue.dequeue(&queue_name, Some(WORKER_ID)).await? else {
            tracing::info!("queue drained");
            break;
        };
        queue.heartbeat(WORKER_ID).await?;

        let report_id = job.payload.get("report_id").cloned().unwrap_or_default();
        let resource = format!("export:{report_id}");
        let outcome = locks
            .with_lock(&resource, LockOptions::default(), || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                report_id.as_u64().is_some_and(|id| id != 2)
            })
            .await?;

        if outcome {
            queue
                .complete(&job.id, json!({"exported": resource}), Some(WORKER_ID))
                .await?;
        } else {
            match queue
                .fail(&job.id, "export target unavailable", None, Some(WORKER_ID))
                .await?
            {
                FailOutcome::Retrying { delay, .. } => {
                    tracing::info!(job_id = %job.id, ?delay, "will retry");
                }
                other => tracing::warn!(job_id = %job.id, ?other, "not retried"),
            }
        }
    }

    let stats = queue.get_queue_stats(&queue_name).await?;
    tracing::info!(?stats, "final queue stats");
    Ok(())
}
