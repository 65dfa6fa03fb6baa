//! Outbox publisher: hands committed PLAN_JOB events to the broker.
//!
//! The claim is skip-locked so concurrent publishers never double-process a
//! row, and the broker publish happens strictly after the commit: a crash in
//! between leaves a SENT row with no task, which the optional sweeper can
//! re-arm, and never a task for an uncommitted row.

use anyhow::Context;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::{collections::HashSet, time::Duration};
use uuid::Uuid;

use fleet_core::{Queue, TaskMessage};

const MAX_OUTBOX_ATTEMPTS: i32 = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishResult {
    pub sent: u64,
    pub failed_payloads: u64,
    pub planned_jobs: u64,
}

pub async fn publish_outbox_once(
    pool: &PgPool,
    queue: &dyn Queue,
    queue_name: &str,
    batch_size: i64,
    resweep_after: Option<Duration>,
) -> anyhow::Result<PublishResult> {
    if let Some(age) = resweep_after {
        resweep_stuck(pool, age).await?;
    }

    let mut tx = pool.begin().await.context("begin outbox publish tx")?;

    let rows = sqlx::query(
        r#"
        SELECT event_id, payload, attempts
        FROM fleet.outbox_event
        WHERE status = 'NEW'
        ORDER BY created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(batch_size)
    .fetch_all(&mut *tx)
    .await
    .context("claim new outbox events")?;

    let mut out = PublishResult::default();
    let mut job_ids = Vec::with_capacity(rows.len());
    for row in rows {
        let event_id: Uuid = row.try_get("event_id")?;
        let payload: Option<Value> = row.try_get("payload")?;
        let attempts: i32 = row.try_get("attempts")?;

        let job_id = payload
            .as_ref()
            .and_then(|p| p.get("job_id"))
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());

        match job_id {
            Some(job_id) => {
                sqlx::query(
                    r#"
                    UPDATE fleet.outbox_event
                    SET status = 'SENT', sent_at = now()
                    WHERE event_id = $1
                    "#,
                )
                .bind(event_id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("mark outbox event_id={event_id} sent"))?;

                job_ids.push(job_id);
                out.sent += 1;
            }
            None => {
                let attempts = attempts + 1;
                let status = if attempts >= MAX_OUTBOX_ATTEMPTS {
                    "FAILED"
                } else {
                    "NEW"
                };
                sqlx::query(
                    r#"
                    UPDATE fleet.outbox_event
                    SET attempts = $2, status = $3
                    WHERE event_id = $1
                    "#,
                )
                .bind(event_id)
                .bind(attempts)
                .bind(status)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("record outbox event_id={event_id} payload failure"))?;

                tracing::warn!(
                    event = "fleet.worker.outbox.payload_invalid",
                    event_id = %event_id,
                    attempts = attempts,
                    status = status,
                    "outbox payload missing job_id"
                );
                out.failed_payloads += 1;
            }
        }
    }

    tx.commit().await.context("commit outbox publish")?;

    // Distinct job ids, first-seen order. Publishing after the commit means a
    // crash here re-plans on the next sweep at worst; planning is idempotent.
    let mut seen = HashSet::new();
    for job_id in job_ids {
        if !seen.insert(job_id) {
            continue;
        }
        let payload = serde_json::to_value(TaskMessage::PlanJob { job_id })
            .context("encode plan task payload")?;
        queue
            .publish(queue_name, payload)
            .await
            .with_context(|| format!("enqueue plan task job_id={job_id}"))?;
        tracing::info!(
            event = "fleet.worker.outbox.plan_enqueued",
            job_id = %job_id,
            "plan task enqueued"
        );
        out.planned_jobs += 1;
    }

    Ok(out)
}

/// Re-arm SENT events older than `age` whose job never left NEW: the publish
/// was committed but the broker hand-off is missing (crash between commit and
/// enqueue). Safe because planning is idempotent.
async fn resweep_stuck(pool: &PgPool, age: Duration) -> anyhow::Result<u64> {
    let rearmed = sqlx::query(
        r#"
        UPDATE fleet.outbox_event e
        SET status = 'NEW', sent_at = NULL
        WHERE e.status = 'SENT'
          AND e.sent_at < now() - ($1::text || ' seconds')::interval
          AND EXISTS (
            SELECT 1
            FROM fleet.jobs j
            WHERE j.job_id = (e.payload->>'job_id')::uuid
              AND j.status = 'NEW'
          )
        "#,
    )
    .bind(age.as_secs().min(i64::MAX as u64) as i64)
    .execute(pool)
    .await
    .context("resweep stuck outbox events")?
    .rows_affected();

    if rearmed > 0 {
        tracing::warn!(
            event = "fleet.worker.outbox.resweep",
            rearmed = rearmed,
            "re-armed stuck SENT outbox events"
        );
    }
    Ok(rearmed)
}
