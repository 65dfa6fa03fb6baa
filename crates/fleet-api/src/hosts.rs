//! Host block policy: which (host, command) pairs refuse to run.
//!
//! Intake consults this set when materializing executions; the runner
//! re-checks it right before taking the host lock.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use uuid::Uuid;

use crate::{ApiError, ApiResult};
use fleet_core::CommandType;

#[derive(Debug, Deserialize)]
pub struct SetBlocksRequest {
    pub commands: Vec<CommandType>,
}

#[derive(Debug, Serialize)]
pub struct BlocksReplaced {
    pub host_id: Uuid,
    pub blocked_commands: Vec<CommandType>,
}

/// Replace the host's block set atomically, deduplicating the input while
/// preserving first occurrence.
pub async fn set_host_blocks(
    pool: &PgPool,
    host_id: Uuid,
    commands: &[CommandType],
) -> ApiResult<BlocksReplaced> {
    let mut seen = HashSet::new();
    let deduped: Vec<CommandType> = commands
        .iter()
        .copied()
        .filter(|cmd| seen.insert(*cmd))
        .collect();

    let mut tx = pool.begin().await.map_err(ApiError::internal)?;

    let exists: Option<Uuid> =
        sqlx::query_scalar("SELECT host_id FROM fleet.hosts WHERE host_id = $1")
            .bind(host_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ApiError::internal)?;
    if exists.is_none() {
        return Err(ApiError::not_found("Host not found"));
    }

    sqlx::query("DELETE FROM fleet.host_command_blocks WHERE host_id = $1")
        .bind(host_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

    if !deduped.is_empty() {
        let commands: Vec<String> = deduped
            .iter()
            .map(|cmd| cmd.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO fleet.host_command_blocks (host_id, command_type)
            SELECT $1, t.command_type
            FROM UNNEST($2::text[]) AS t(command_type)
            "#,
        )
        .bind(host_id)
        .bind(&commands)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;
    }

    let current: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT command_type
        FROM fleet.host_command_blocks
        WHERE host_id = $1
        ORDER BY command_type ASC
        "#,
    )
    .bind(host_id)
    .fetch_all(&mut *tx)
    .await
    .map_err(ApiError::internal)?;

    tx.commit().await.map_err(ApiError::internal)?;

    tracing::info!(
        event = "fleet.api.host.blocks_replaced",
        host_id = %host_id,
        blocks = current.len(),
        "host blocks replaced"
    );

    let blocked_commands = current
        .iter()
        .map(|s| s.parse::<CommandType>())
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(ApiError::internal)?;

    Ok(BlocksReplaced {
        host_id,
        blocked_commands,
    })
}

#[derive(Debug, Serialize)]
pub struct BlockDeleted {
    pub deleted: u64,
}

pub async fn delete_host_block(
    pool: &PgPool,
    host_id: Uuid,
    command: CommandType,
) -> ApiResult<BlockDeleted> {
    let exists: Option<Uuid> =
        sqlx::query_scalar("SELECT host_id FROM fleet.hosts WHERE host_id = $1")
            .bind(host_id)
            .fetch_optional(pool)
            .await
            .map_err(ApiError::internal)?;
    if exists.is_none() {
        return Err(ApiError::not_found("Host not found"));
    }

    let deleted = sqlx::query(
        r#"
        DELETE FROM fleet.host_command_blocks
        WHERE host_id = $1
          AND command_type = $2
        "#,
    )
    .bind(host_id)
    .bind(command.as_str())
    .execute(pool)
    .await
    .map_err(ApiError::internal)?
    .rows_affected();

    Ok(BlockDeleted { deleted })
}
