//! Beat: schedules PUBLISH_OUTBOX on a fixed cadence (default every 2 s).

use anyhow::Context;
use std::time::Duration;

use fleet_core::{Queue, TaskMessage};

pub async fn run(queue: &dyn Queue, queue_name: &str, interval: Duration) -> anyhow::Result<()> {
    tracing::info!(
        event = "fleet.worker.beat.started",
        queue = %queue_name,
        interval_ms = interval.as_millis() as u64,
        "beat started"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(event = "fleet.worker.beat.shutdown", "beat shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {
                tick_once(queue, queue_name).await?;
            }
        }
    }
}

pub async fn tick_once(queue: &dyn Queue, queue_name: &str) -> anyhow::Result<()> {
    let payload =
        serde_json::to_value(TaskMessage::PublishOutbox).context("encode publish task payload")?;
    queue
        .publish(queue_name, payload)
        .await
        .context("enqueue publish_outbox task")?;
    Ok(())
}
