//! Background task handlers for the fleet orchestrator.
//!
//! A worker pulls task messages off the single `default` queue and dispatches
//! on the task name: PUBLISH_OUTBOX drains the transactional outbox, PLAN_JOB
//! moves a job's NEW executions to QUEUED, RUN_EXECUTION runs one execution
//! against its host. Handlers return an [`Outcome`]; the loop acks on `Done`
//! and requeues with an explicit countdown on `RetryAfter`, so unacked
//! messages from a crashed worker redeliver after the visibility timeout.

use anyhow::Context;
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};

use fleet_core::{retry::RetryPolicy, Queue, QueueMessage, TaskMessage};

pub mod agent;
pub mod beat;
pub mod outbox;
pub mod planner;
pub mod runner;

use agent::Agent;

/// What a task handler wants done with the message it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    RetryAfter(Duration),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub requeue_delay: Duration,
    pub plan_batch_size: i64,
    pub outbox_batch_size: i64,
    pub outbox_resweep_after: Option<Duration>,
    pub lock_retry_limit: u32,
}

pub struct Worker {
    pool: PgPool,
    queue: Arc<dyn Queue>,
    agent: Arc<dyn Agent>,
    policy: RetryPolicy,
    cfg: WorkerConfig,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn Queue>,
        agent: Arc<dyn Agent>,
        policy: RetryPolicy,
        cfg: WorkerConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            agent,
            policy,
            cfg,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            event = "fleet.worker.started",
            queue = %self.cfg.queue,
            "worker started"
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(event = "fleet.worker.shutdown", "worker shutting down");
                    return Ok(());
                }
                res = self.queue.receive(&self.cfg.queue, 1, self.cfg.visibility_timeout) => {
                    let messages = res?;
                    if messages.is_empty() {
                        tokio::time::sleep(self.cfg.poll_interval).await;
                        continue;
                    }

                    for msg in messages {
                        if let Err(err) = self.handle_message(msg).await {
                            tracing::warn!(
                                event = "fleet.worker.message.error",
                                error = %err,
                                "worker message handling failed"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Receive and process at most one message. Returns whether a message was
    /// seen; handler errors are logged, not propagated, matching the loop.
    pub async fn step(&self) -> anyhow::Result<bool> {
        let messages = self
            .queue
            .receive(&self.cfg.queue, 1, self.cfg.visibility_timeout)
            .await?;
        let Some(msg) = messages.into_iter().next() else {
            return Ok(false);
        };

        if let Err(err) = self.handle_message(msg).await {
            tracing::warn!(
                event = "fleet.worker.message.error",
                error = %err,
                "worker message handling failed"
            );
        }
        Ok(true)
    }

    /// Process messages until the queue has nothing deliverable (retry
    /// countdowns push messages into the future, so this terminates).
    pub async fn drain(&self) -> anyhow::Result<usize> {
        let mut processed = 0;
        while self.step().await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn handle_message(&self, msg: QueueMessage) -> anyhow::Result<()> {
        let ack_token = msg.ack_token.clone();
        let task: TaskMessage = match serde_json::from_value(msg.payload.clone()) {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!(
                    event = "fleet.worker.task.invalid",
                    error = %err,
                    message_id = %msg.message_id,
                    "invalid task payload; dropping"
                );
                self.queue.ack(&ack_token).await?;
                return Ok(());
            }
        };

        let res: anyhow::Result<Outcome> = match task {
            TaskMessage::PublishOutbox => outbox::publish_outbox_once(
                &self.pool,
                self.queue.as_ref(),
                &self.cfg.queue,
                self.cfg.outbox_batch_size,
                self.cfg.outbox_resweep_after,
            )
            .await
            .map(|_| Outcome::Done),
            TaskMessage::PlanJob { job_id } => planner::plan_job(
                &self.pool,
                self.queue.as_ref(),
                &self.cfg.queue,
                job_id,
                self.cfg.plan_batch_size,
            )
            .await
            .map(|_| Outcome::Done),
            TaskMessage::RunExecution { execution_id } => {
                let retries_done = (msg.deliveries - 1).max(0) as u32;
                runner::run_execution(
                    &self.pool,
                    self.agent.as_ref(),
                    &self.policy,
                    execution_id,
                    retries_done,
                    self.cfg.lock_retry_limit,
                )
                .await
            }
        };

        match res {
            Ok(Outcome::Done) => {
                self.queue.ack(&ack_token).await?;
                Ok(())
            }
            Ok(Outcome::RetryAfter(delay)) => {
                self.queue
                    .requeue(&ack_token, delay)
                    .await
                    .context("requeue task with countdown")?;
                Ok(())
            }
            Err(err) => {
                self.queue
                    .requeue(&ack_token, self.cfg.requeue_delay)
                    .await
                    .context("requeue task after handler error")?;
                Err(err)
            }
        }
    }
}
