//! PLAN_JOB: move a job's NEW executions to QUEUED and fan out run tasks.
//!
//! Safe under duplicate delivery: the job transition is guarded on NEW, and
//! the execution claim is skip-locked plus status-guarded, so each execution
//! is transitioned exactly once however many planners race.

use anyhow::Context;
use sqlx::PgPool;
use uuid::Uuid;

use fleet_core::{Queue, TaskMessage};

pub async fn plan_job(
    pool: &PgPool,
    queue: &dyn Queue,
    queue_name: &str,
    job_id: Uuid,
    batch_size: i64,
) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await.context("begin plan_job tx")?;

    let command_type: Option<String> = sqlx::query_scalar(
        r#"
        SELECT command_type
        FROM fleet.jobs
        WHERE job_id = $1
          AND status = 'NEW'
          AND (approval_state IS NULL OR approval_state = 'APPROVED')
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await
    .context("select plannable job")?;

    let Some(command_type) = command_type else {
        tracing::info!(
            event = "fleet.worker.plan.skipped",
            job_id = %job_id,
            "job not plannable; skipping"
        );
        return Ok(0);
    };

    sqlx::query("UPDATE fleet.jobs SET status = 'QUEUED' WHERE job_id = $1 AND status = 'NEW'")
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .context("queue job")?;

    tx.commit().await.context("commit job queue tx")?;

    tracing::info!(
        event = "fleet.worker.plan.job_queued",
        job_id = %job_id,
        command_type = %command_type,
        "job queued"
    );

    let mut planned = 0u64;
    loop {
        let mut tx = pool.begin().await.context("begin plan batch tx")?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT execution_id
            FROM fleet.executions
            WHERE job_id = $1
              AND status = 'NEW'
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(job_id)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await
        .context("claim new executions")?;

        if ids.is_empty() {
            break;
        }

        sqlx::query(
            r#"
            UPDATE fleet.executions
            SET status = 'QUEUED'
            WHERE execution_id = ANY($1)
              AND status = 'NEW'
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .context("queue claimed executions")?;

        tx.commit().await.context("commit plan batch tx")?;

        for execution_id in &ids {
            let payload = serde_json::to_value(TaskMessage::RunExecution {
                execution_id: *execution_id,
            })
            .context("encode run task payload")?;
            queue
                .publish(queue_name, payload)
                .await
                .with_context(|| format!("enqueue run task execution_id={execution_id}"))?;
        }

        tracing::info!(
            event = "fleet.worker.plan.executions_queued",
            job_id = %job_id,
            batch = ids.len(),
            "executions queued"
        );
        planned += ids.len() as u64;
    }

    Ok(planned)
}
