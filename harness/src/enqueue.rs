use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use fleet_core::{pgqueue::PgQueue, Queue, TaskMessage};

/// Manually enqueue a PLAN_JOB task.
///
/// Purely for manual testing ergonomics: `api`, `worker` and `beat` can run
/// in separate terminals and a stuck job can be re-planned without psql.
pub async fn run(cfg: &OrchestratorConfig, job_id: Uuid) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.postgres_url)
        .await
        .context("connect db")?;

    let queue = PgQueue::new(pool);
    let payload =
        serde_json::to_value(TaskMessage::PlanJob { job_id }).context("encode plan task")?;
    queue
        .publish(&cfg.task_queue, payload)
        .await
        .context("publish plan task")?;

    println!("enqueued plan task job_id={job_id}");
    Ok(())
}
