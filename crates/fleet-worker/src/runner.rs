//! RUN_EXECUTION: single-attempt execution of one (job, host) pair.
//!
//! This is the state machine's critical section: the only place SUCCESS,
//! FAILED, TIMEOUT and run-time BLOCKED are produced and attempts counted.
//! Per-host mutual exclusion comes from a session-scoped advisory lock held
//! on a dedicated connection for the whole attempt; Postgres releases it on
//! connection loss, so a crashed worker cannot wedge a host.

use anyhow::Context;
use serde_json::Value;
use sqlx::{Connection, PgPool, Row};
use uuid::Uuid;

use crate::agent::{Agent, AgentError};
use crate::Outcome;
use fleet_core::{hostlock, retry::RetryPolicy, CommandType, ExecutionStatus};

struct ExecutionCtx {
    job_id: Uuid,
    host_id: Uuid,
    hostname: String,
    command_type: CommandType,
    payload: Value,
}

pub async fn run_execution(
    pool: &PgPool,
    agent: &dyn Agent,
    policy: &RetryPolicy,
    execution_id: Uuid,
    retries_done: u32,
    lock_retry_limit: u32,
) -> anyhow::Result<Outcome> {
    let row = sqlx::query(
        r#"
        SELECT e.job_id, e.host_id, e.status, h.hostname, j.command_type, j.payload
        FROM fleet.executions e
        JOIN fleet.hosts h ON h.host_id = e.host_id
        JOIN fleet.jobs j ON j.job_id = e.job_id
        WHERE e.execution_id = $1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .context("load execution")?;

    let Some(row) = row else {
        return Ok(Outcome::Done);
    };

    let status: ExecutionStatus = row.try_get::<String, _>("status")?.parse()?;
    if status.is_terminal() || status != ExecutionStatus::Queued {
        // Stale delivery; another runner owns it or already finished it.
        return Ok(Outcome::Done);
    }

    let ctx = ExecutionCtx {
        job_id: row.try_get("job_id")?,
        host_id: row.try_get("host_id")?,
        hostname: row.try_get("hostname")?,
        command_type: row.try_get::<String, _>("command_type")?.parse()?,
        payload: row.try_get("payload")?,
    };

    if host_is_blocked(pool, ctx.host_id, ctx.command_type).await? {
        let mut tx = pool.begin().await.context("begin block tx")?;
        let updated = sqlx::query(
            r#"
            UPDATE fleet.executions
            SET status = 'BLOCKED', finished_at = now()
            WHERE execution_id = $1
              AND status = 'QUEUED'
            "#,
        )
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .context("mark execution blocked")?
        .rows_affected();

        if updated == 1 {
            append_log(&mut *tx, execution_id, "blocked by host policy").await?;
        }
        tx.commit().await.context("commit block tx")?;

        tracing::info!(
            event = "fleet.worker.run.blocked",
            execution_id = %execution_id,
            host_id = %ctx.host_id,
            command_type = ctx.command_type.as_str(),
            "execution blocked by host policy"
        );
        return Ok(Outcome::Done);
    }

    let key = hostlock::host_lock_key(ctx.host_id);
    let mut lock_conn = pool.acquire().await.context("acquire lock connection")?;

    if !hostlock::try_lock_host(&mut lock_conn, key).await? {
        append_log(pool, execution_id, "host locked").await?;

        if retries_done >= lock_retry_limit {
            // Secondary ceiling: the lock holder may never release (wedged
            // agent, operator lock); stop the redelivery storm here.
            let mut tx = pool.begin().await.context("begin lock-exhausted tx")?;
            let updated = sqlx::query(
                r#"
                UPDATE fleet.executions
                SET status = 'FAILED', finished_at = now()
                WHERE execution_id = $1
                  AND status = 'QUEUED'
                "#,
            )
            .bind(execution_id)
            .execute(&mut *tx)
            .await
            .context("fail lock-starved execution")?
            .rows_affected();

            if updated == 1 {
                append_log(&mut *tx, execution_id, "host lock retries exhausted").await?;
            }
            tx.commit().await.context("commit lock-exhausted tx")?;

            tracing::warn!(
                event = "fleet.worker.run.lock_exhausted",
                execution_id = %execution_id,
                host_id = %ctx.host_id,
                retries = retries_done,
                "host lock retries exhausted"
            );
            return Ok(Outcome::Done);
        }

        tracing::info!(
            event = "fleet.worker.run.host_locked",
            execution_id = %execution_id,
            host_id = %ctx.host_id,
            retries = retries_done,
            "host locked; will retry"
        );
        return Ok(Outcome::RetryAfter(policy.backoff(retries_done)));
    }

    let result = run_locked(pool, agent, policy, execution_id, &ctx, retries_done).await;

    if hostlock::unlock_host(&mut lock_conn, key).await.is_err() {
        // The lock dies with the session; do not hand a still-locked
        // connection back to the pool.
        let conn = lock_conn.detach();
        let _ = conn.close().await;
    }

    result
}

async fn host_is_blocked(
    pool: &PgPool,
    host_id: Uuid,
    command_type: CommandType,
) -> anyhow::Result<bool> {
    let blocked: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT block_id
        FROM fleet.host_command_blocks
        WHERE host_id = $1
          AND command_type = $2
        "#,
    )
    .bind(host_id)
    .bind(command_type.as_str())
    .fetch_optional(pool)
    .await
    .context("check host block")?;

    Ok(blocked.is_some())
}

async fn run_locked(
    pool: &PgPool,
    agent: &dyn Agent,
    policy: &RetryPolicy,
    execution_id: Uuid,
    ctx: &ExecutionCtx,
    retries_done: u32,
) -> anyhow::Result<Outcome> {
    let mut tx = pool.begin().await.context("begin running tx")?;

    let updated = sqlx::query(
        r#"
        UPDATE fleet.executions
        SET status = 'RUNNING',
            started_at = now(),
            attempts = attempts + 1
        WHERE execution_id = $1
          AND status = 'QUEUED'
        "#,
    )
    .bind(execution_id)
    .execute(&mut *tx)
    .await
    .context("mark execution running")?
    .rows_affected();

    if updated == 0 {
        // Lost the race; whatever another runner applied stands.
        tx.commit().await.context("commit lost-race tx")?;
        return Ok(Outcome::Done);
    }

    sqlx::query("UPDATE fleet.jobs SET status = 'RUNNING' WHERE job_id = $1 AND status = 'QUEUED'")
        .bind(ctx.job_id)
        .execute(&mut *tx)
        .await
        .context("advance job to running")?;

    tx.commit().await.context("commit running tx")?;

    tracing::info!(
        event = "fleet.worker.run.started",
        execution_id = %execution_id,
        job_id = %ctx.job_id,
        hostname = %ctx.hostname,
        command_type = ctx.command_type.as_str(),
        "execution started"
    );

    match agent.run(&ctx.hostname, ctx.command_type, &ctx.payload).await {
        Ok(output) => {
            let mut tx = pool.begin().await.context("begin success tx")?;
            sqlx::query(
                r#"
                UPDATE fleet.executions
                SET status = 'SUCCESS', finished_at = now()
                WHERE execution_id = $1
                  AND status = 'RUNNING'
                "#,
            )
            .bind(execution_id)
            .execute(&mut *tx)
            .await
            .context("mark execution success")?;

            let line = serde_json::to_string(&output).context("encode agent output")?;
            append_log(&mut *tx, execution_id, &line).await?;
            tx.commit().await.context("commit success tx")?;

            tracing::info!(
                event = "fleet.worker.run.success",
                execution_id = %execution_id,
                hostname = %ctx.hostname,
                "execution succeeded"
            );
            Ok(Outcome::Done)
        }
        Err(err) => retry_or_finish(pool, policy, execution_id, retries_done, &err).await,
    }
}

async fn retry_or_finish(
    pool: &PgPool,
    policy: &RetryPolicy,
    execution_id: Uuid,
    retries_done: u32,
    err: &AgentError,
) -> anyhow::Result<Outcome> {
    let mut tx = pool.begin().await.context("begin retry tx")?;

    if retries_done < policy.max_retries {
        sqlx::query(
            r#"
            UPDATE fleet.executions
            SET status = 'QUEUED'
            WHERE execution_id = $1
              AND status = 'RUNNING'
            "#,
        )
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .context("requeue failed execution")?;

        append_log(&mut *tx, execution_id, &err.to_string()).await?;
        tx.commit().await.context("commit retry tx")?;

        let delay = policy.backoff(retries_done);
        tracing::warn!(
            event = "fleet.worker.run.retry",
            execution_id = %execution_id,
            retries = retries_done,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "agent call failed; retrying"
        );
        return Ok(Outcome::RetryAfter(delay));
    }

    let final_status = if err.is_timeout() { "TIMEOUT" } else { "FAILED" };
    sqlx::query(
        r#"
        UPDATE fleet.executions
        SET status = $2, finished_at = now()
        WHERE execution_id = $1
          AND status = 'RUNNING'
        "#,
    )
    .bind(execution_id)
    .bind(final_status)
    .execute(&mut *tx)
    .await
    .context("finish failed execution")?;

    append_log(&mut *tx, execution_id, &err.to_string()).await?;
    tx.commit().await.context("commit terminal failure tx")?;

    tracing::warn!(
        event = "fleet.worker.run.exhausted",
        execution_id = %execution_id,
        status = final_status,
        retries = retries_done,
        error = %err,
        "retries exhausted"
    );
    Ok(Outcome::Done)
}

async fn append_log<'e, E>(executor: E, execution_id: Uuid, line: &str) -> anyhow::Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query("INSERT INTO fleet.execution_logs (execution_id, line) VALUES ($1, $2)")
        .bind(execution_id)
        .bind(line)
        .execute(executor)
        .await
        .context("append execution log")?;
    Ok(())
}
