//! Job intake, approval gate, and read endpoints.
//!
//! Intake is idempotent on `external_id` and materializes the whole fan-out
//! (job, executions, outbox hand-off) in one transaction, so a crash leaves
//! either nothing or a fully planned job behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::{rollup, ApiError, ApiResult};
use fleet_core::{ApprovalState, CommandType, ExecutionStatus};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Selector {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostnames: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub external_id: String,
    pub command_type: CommandType,
    pub selector: Selector,
    pub payload: Value,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobCreated {
    pub job_id: Uuid,
}

pub async fn create_job(pool: &PgPool, req: &CreateJobRequest) -> ApiResult<JobCreated> {
    tracing::info!(
        event = "fleet.api.webhook.received",
        external_id = %req.external_id,
        command_type = req.command_type.as_str(),
        "webhook received"
    );

    let mut tx = pool.begin().await.map_err(ApiError::internal)?;

    let existing: Option<Uuid> =
        sqlx::query_scalar("SELECT job_id FROM fleet.jobs WHERE external_id = $1")
            .bind(&req.external_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

    if let Some(job_id) = existing {
        return Ok(JobCreated { job_id });
    }

    let approval_state = req
        .command_type
        .requires_approval()
        .then_some(ApprovalState::WaitApproval);

    let selector = serde_json::to_value(&req.selector).map_err(ApiError::internal)?;
    let job_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO fleet.jobs (external_id, signature, selector, payload, command_type, approval_state)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING job_id
        "#,
    )
    .bind(&req.external_id)
    .bind(&req.signature)
    .bind(selector)
    .bind(&req.payload)
    .bind(req.command_type.as_str())
    .bind(approval_state.map(|s| s.as_str()))
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::internal)?;

    let host_ids = resolve_selector(&mut tx, &req.selector).await?;

    let blocked: HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
        "SELECT host_id FROM fleet.host_command_blocks WHERE command_type = $1",
    )
    .bind(req.command_type.as_str())
    .fetch_all(&mut *tx)
    .await
    .map_err(ApiError::internal)?
    .into_iter()
    .collect();

    if !host_ids.is_empty() {
        let statuses: Vec<String> = host_ids
            .iter()
            .map(|id| {
                if blocked.contains(id) {
                    ExecutionStatus::Blocked.as_str().to_string()
                } else {
                    ExecutionStatus::New.as_str().to_string()
                }
            })
            .collect();

        sqlx::query(
            r#"
            INSERT INTO fleet.executions (job_id, host_id, status)
            SELECT $1, t.host_id, t.status
            FROM UNNEST($2::uuid[], $3::text[]) AS t(host_id, status)
            "#,
        )
        .bind(job_id)
        .bind(&host_ids)
        .bind(&statuses)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;
    }

    if approval_state.is_none() {
        sqlx::query(
            r#"
            INSERT INTO fleet.outbox_event (event_type, payload)
            VALUES ('PLAN_JOB', $1)
            "#,
        )
        .bind(serde_json::json!({ "job_id": job_id }))
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;
    }

    tx.commit().await.map_err(ApiError::internal)?;

    tracing::info!(
        event = "fleet.api.job.created",
        job_id = %job_id,
        external_id = %req.external_id,
        command_type = req.command_type.as_str(),
        hosts = host_ids.len(),
        "job created"
    );

    Ok(JobCreated { job_id })
}

async fn resolve_selector(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    selector: &Selector,
) -> ApiResult<Vec<Uuid>> {
    if selector.all {
        return sqlx::query_scalar("SELECT host_id FROM fleet.hosts")
            .fetch_all(&mut **tx)
            .await
            .map_err(ApiError::internal);
    }

    let Some(hostnames) = &selector.hostnames else {
        return Err(ApiError::bad_request(
            "selector requires all:true or hostnames",
        ));
    };

    let rows = sqlx::query("SELECT hostname, host_id FROM fleet.hosts WHERE hostname = ANY($1)")
        .bind(hostnames)
        .fetch_all(&mut **tx)
        .await
        .map_err(ApiError::internal)?;

    let mut by_name = HashMap::with_capacity(rows.len());
    for row in &rows {
        let hostname: String = row.try_get("hostname").map_err(ApiError::internal)?;
        let host_id: Uuid = row.try_get("host_id").map_err(ApiError::internal)?;
        by_name.insert(hostname, host_id);
    }

    let missing: Vec<&str> = hostnames
        .iter()
        .filter(|name| !by_name.contains_key(*name))
        .map(String::as_str)
        .collect();

    if !missing.is_empty() {
        return Err(ApiError::not_found(format!(
            "Missing hosts: {}",
            missing.join(",")
        )));
    }

    Ok(by_name.into_values().collect())
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub job_id: Uuid,
    pub approval_state: ApprovalState,
    pub enqueued: bool,
}

pub async fn approve_job(pool: &PgPool, job_id: Uuid) -> ApiResult<ApproveResponse> {
    let mut tx = pool.begin().await.map_err(ApiError::internal)?;

    let row = sqlx::query("SELECT approval_state FROM fleet.jobs WHERE job_id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

    let Some(row) = row else {
        return Err(ApiError::not_found("job not found"));
    };
    let state: Option<String> = row.try_get("approval_state").map_err(ApiError::internal)?;

    match state.as_deref() {
        Some("APPROVED") => Ok(ApproveResponse {
            job_id,
            approval_state: ApprovalState::Approved,
            enqueued: false,
        }),
        Some("WAIT_APPROVAL") => {
            sqlx::query("UPDATE fleet.jobs SET approval_state = 'APPROVED' WHERE job_id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(ApiError::internal)?;

            sqlx::query(
                r#"
                INSERT INTO fleet.outbox_event (event_type, payload)
                VALUES ('PLAN_JOB', $1)
                "#,
            )
            .bind(serde_json::json!({ "job_id": job_id }))
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

            tx.commit().await.map_err(ApiError::internal)?;

            tracing::info!(event = "fleet.api.job.approved", job_id = %job_id, "job approved");
            Ok(ApproveResponse {
                job_id,
                approval_state: ApprovalState::Approved,
                enqueued: true,
            })
        }
        other => Err(ApiError::conflict(format!(
            "job not waiting approval (state={})",
            other.unwrap_or("NONE")
        ))),
    }
}

#[derive(Debug, Serialize)]
pub struct RejectResponse {
    pub job_id: Uuid,
    pub approval_state: ApprovalState,
    pub status: String,
    pub cancelled_executions: i64,
}

pub async fn reject_job(pool: &PgPool, job_id: Uuid) -> ApiResult<RejectResponse> {
    let mut tx = pool.begin().await.map_err(ApiError::internal)?;

    let row =
        sqlx::query("SELECT approval_state, status FROM fleet.jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

    let Some(row) = row else {
        return Err(ApiError::not_found("job not found"));
    };
    let state: Option<String> = row.try_get("approval_state").map_err(ApiError::internal)?;
    let status: String = row.try_get("status").map_err(ApiError::internal)?;

    match state.as_deref() {
        Some("REJECTED") => Ok(RejectResponse {
            job_id,
            approval_state: ApprovalState::Rejected,
            status,
            cancelled_executions: 0,
        }),
        Some("WAIT_APPROVAL") => {
            sqlx::query(
                "UPDATE fleet.jobs SET approval_state = 'REJECTED', status = 'FAILED' WHERE job_id = $1",
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

            let cancelled = sqlx::query(
                r#"
                UPDATE fleet.executions
                SET status = 'CANCELLED'
                WHERE job_id = $1
                  AND status IN ('NEW', 'QUEUED')
                "#,
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?
            .rows_affected();

            tx.commit().await.map_err(ApiError::internal)?;

            tracing::info!(
                event = "fleet.api.job.rejected",
                job_id = %job_id,
                cancelled = cancelled,
                "job rejected"
            );
            Ok(RejectResponse {
                job_id,
                approval_state: ApprovalState::Rejected,
                status: "FAILED".to_string(),
                cancelled_executions: cancelled as i64,
            })
        }
        other => Err(ApiError::conflict(format!(
            "job is not waiting for approval (approval_state={})",
            other.unwrap_or("NONE")
        ))),
    }
}

#[derive(Debug, Serialize)]
pub struct JobListItem {
    pub job_id: Uuid,
    pub external_id: String,
    pub command_type: String,
    pub status: String,
    pub approval_state: Option<String>,
}

pub async fn list_jobs(pool: &PgPool, limit: i64, offset: i64) -> ApiResult<Vec<JobListItem>> {
    let rows = sqlx::query(
        r#"
        SELECT job_id, external_id, command_type, status, approval_state
        FROM fleet.jobs
        ORDER BY created_at DESC
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit.clamp(1, 500))
    .bind(offset.max(0))
    .fetch_all(pool)
    .await
    .map_err(ApiError::internal)?;

    rows.into_iter()
        .map(|row| {
            Ok(JobListItem {
                job_id: row.try_get("job_id").map_err(ApiError::internal)?,
                external_id: row.try_get("external_id").map_err(ApiError::internal)?,
                command_type: row.try_get("command_type").map_err(ApiError::internal)?,
                status: row.try_get("status").map_err(ApiError::internal)?,
                approval_state: row.try_get("approval_state").map_err(ApiError::internal)?,
            })
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    pub job_id: Uuid,
    pub external_id: String,
    pub command_type: String,
    pub status: String,
    pub approval_state: Option<String>,
    pub executions_total: i64,
    pub executions_by_status: BTreeMap<String, i64>,
    pub summary: rollup::Summary,
}

pub async fn job_detail(pool: &PgPool, job_id: Uuid) -> ApiResult<JobDetail> {
    let row = sqlx::query(
        r#"
        SELECT external_id, command_type, status, approval_state
        FROM fleet.jobs
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
    .map_err(ApiError::internal)?;

    let Some(row) = row else {
        return Err(ApiError::not_found("job not found"));
    };

    let count_rows = sqlx::query(
        r#"
        SELECT status, count(*) AS cnt
        FROM fleet.executions
        WHERE job_id = $1
        GROUP BY status
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .map_err(ApiError::internal)?;

    let mut counts = BTreeMap::new();
    let mut histogram = BTreeMap::new();
    for count_row in count_rows {
        let status: String = count_row.try_get("status").map_err(ApiError::internal)?;
        let cnt: i64 = count_row.try_get("cnt").map_err(ApiError::internal)?;
        let parsed: ExecutionStatus = status.parse().map_err(ApiError::internal)?;
        histogram.insert(parsed, cnt);
        counts.insert(status, cnt);
    }

    let total: i64 = counts.values().sum();

    Ok(JobDetail {
        job_id,
        external_id: row.try_get("external_id").map_err(ApiError::internal)?,
        command_type: row.try_get("command_type").map_err(ApiError::internal)?,
        status: row.try_get("status").map_err(ApiError::internal)?,
        approval_state: row.try_get("approval_state").map_err(ApiError::internal)?,
        executions_total: total,
        executions_by_status: counts,
        summary: rollup::summarize(&histogram),
    })
}

#[derive(Debug, Serialize)]
pub struct ExecutionView {
    pub execution_id: Uuid,
    pub host_id: Uuid,
    pub hostname: String,
    pub attempts: i32,
    pub status: String,
}

pub async fn job_executions(
    pool: &PgPool,
    job_id: Uuid,
    status: Option<ExecutionStatus>,
    limit: i64,
    offset: i64,
) -> ApiResult<Vec<ExecutionView>> {
    if !(1..=500).contains(&limit) {
        return Err(ApiError::bad_request("limit must be between 1 and 500"));
    }
    if offset < 0 {
        return Err(ApiError::bad_request("offset must be non-negative"));
    }

    let exists: Option<Uuid> = sqlx::query_scalar("SELECT job_id FROM fleet.jobs WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .map_err(ApiError::internal)?;
    if exists.is_none() {
        return Err(ApiError::not_found("job not found"));
    }

    let rows = sqlx::query(
        r#"
        SELECT e.execution_id, e.host_id, h.hostname, e.attempts, e.status
        FROM fleet.executions e
        JOIN fleet.hosts h ON h.host_id = e.host_id
        WHERE e.job_id = $1
          AND ($2::text IS NULL OR e.status = $2)
        ORDER BY h.hostname ASC
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(job_id)
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(ApiError::internal)?;

    rows.into_iter()
        .map(|row| {
            Ok(ExecutionView {
                execution_id: row.try_get("execution_id").map_err(ApiError::internal)?,
                host_id: row.try_get("host_id").map_err(ApiError::internal)?,
                hostname: row.try_get("hostname").map_err(ApiError::internal)?,
                attempts: row.try_get("attempts").map_err(ApiError::internal)?,
                status: row.try_get("status").map_err(ApiError::internal)?,
            })
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct LogLine {
    pub execution_id: Uuid,
    pub ts: DateTime<Utc>,
    pub line: String,
}

pub async fn execution_logs(pool: &PgPool, execution_id: Uuid) -> ApiResult<Vec<LogLine>> {
    let rows = sqlx::query(
        r#"
        SELECT execution_id, ts, line
        FROM fleet.execution_logs
        WHERE execution_id = $1
        ORDER BY ts ASC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .map_err(ApiError::internal)?;

    rows.into_iter()
        .map(|row| {
            Ok(LogLine {
                execution_id: row.try_get("execution_id").map_err(ApiError::internal)?,
                ts: row.try_get("ts").map_err(ApiError::internal)?,
                line: row.try_get("line").map_err(ApiError::internal)?,
            })
        })
        .collect()
}
