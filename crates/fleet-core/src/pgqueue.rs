use crate::{Queue, QueueMessage};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// Postgres-backed broker transport.
///
/// One timestamp drives delivery: a message is deliverable while
/// `visible_at <= now()`. Receiving leases the row by pushing `visible_at`
/// past the visibility timeout and bumping `delivery_count`; acking deletes
/// the row; an unacked message reappears once the lease lapses, so a crashed
/// worker's message redelivers. `requeue` with a delay is the same push with
/// a caller-chosen countdown, which is how explicit-backoff retries ride the
/// queue. The runner reads its broker retry count off `delivery_count`.
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Queue for PgQueue {
    async fn publish(&self, queue: &str, payload: Value) -> anyhow::Result<String> {
        let message_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO fleet.queue_messages (queue_name, payload)
            VALUES ($1, $2)
            RETURNING message_id
            "#,
        )
        .bind(queue)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("publish to queue={queue}"))?;

        Ok(message_id.to_string())
    }

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> anyhow::Result<Vec<QueueMessage>> {
        let rows = sqlx::query(
            r#"
            UPDATE fleet.queue_messages
            SET visible_at = now() + make_interval(secs => $3),
                delivery_count = delivery_count + 1
            WHERE message_id IN (
              SELECT message_id
              FROM fleet.queue_messages
              WHERE queue_name = $1
                AND visible_at <= now()
              ORDER BY enqueued_at
              LIMIT $2
              FOR UPDATE SKIP LOCKED
            )
            RETURNING message_id, payload, delivery_count
            "#,
        )
        .bind(queue)
        .bind(max)
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("receive from queue={queue}"))?;

        rows.into_iter()
            .map(|row| {
                let id: Uuid = row.try_get("message_id")?;
                Ok(QueueMessage {
                    ack_token: id.to_string(),
                    message_id: id.to_string(),
                    queue_name: queue.to_string(),
                    payload: row.try_get("payload")?,
                    deliveries: row.try_get("delivery_count")?,
                })
            })
            .collect()
    }

    async fn ack(&self, ack_token: &str) -> anyhow::Result<()> {
        let message_id = parse_token(ack_token)?;
        sqlx::query("DELETE FROM fleet.queue_messages WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("ack message_id={message_id}"))?;

        Ok(())
    }

    async fn requeue(&self, ack_token: &str, delay: Duration) -> anyhow::Result<()> {
        let message_id = parse_token(ack_token)?;
        sqlx::query(
            r#"
            UPDATE fleet.queue_messages
            SET visible_at = now() + make_interval(secs => $2)
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .with_context(|| format!("requeue message_id={message_id}"))?;

        Ok(())
    }
}

fn parse_token(ack_token: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(ack_token).context("ack token is not a message id")
}
