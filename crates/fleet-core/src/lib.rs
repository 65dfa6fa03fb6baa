//! Shared contracts for the fleet orchestrator.
//!
//! This crate defines the cross-crate vocabulary used by the API service and
//! the workers: the domain enums (command types and the Job / Execution /
//! Outbox state machines), the broker `Queue` trait with its Postgres-backed
//! transport, the broker task payloads, the retry/backoff policy, and the
//! per-host advisory-lock key.
//!
//! Statuses are stored as TEXT in Postgres; the enums here are the one place
//! that owns the string values.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{str::FromStr, time::Duration};
use uuid::Uuid;

pub mod hostlock;
pub mod pgqueue;
pub mod retry;

/// The single broker queue every task rides on.
pub const DEFAULT_QUEUE: &str = "default";

/// Commands a job can ask the fleet to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Ping,
    RestartService,
    Deploy,
    RunScript,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Ping => "PING",
            CommandType::RestartService => "RESTART_SERVICE",
            CommandType::Deploy => "DEPLOY",
            CommandType::RunScript => "RUN_SCRIPT",
        }
    }

    /// The approval-required set: RESTART_SERVICE, DEPLOY, RUN_SCRIPT.
    pub fn requires_approval(&self) -> bool {
        matches!(
            self,
            CommandType::RestartService | CommandType::Deploy | CommandType::RunScript
        )
    }
}

impl FromStr for CommandType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PING" => Ok(CommandType::Ping),
            "RESTART_SERVICE" => Ok(CommandType::RestartService),
            "DEPLOY" => Ok(CommandType::Deploy),
            "RUN_SCRIPT" => Ok(CommandType::RunScript),
            other => Err(anyhow::anyhow!("unknown command type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Queued,
    Running,
    Success,
    Failed,
    Partial,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "NEW",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Partial => "PARTIAL",
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(JobStatus::New),
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            "PARTIAL" => Ok(JobStatus::Partial),
            other => Err(anyhow::anyhow!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    WaitApproval,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::WaitApproval => "WAIT_APPROVAL",
            ApprovalState::Approved => "APPROVED",
            ApprovalState::Rejected => "REJECTED",
        }
    }
}

impl FromStr for ApprovalState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAIT_APPROVAL" => Ok(ApprovalState::WaitApproval),
            "APPROVED" => Ok(ApprovalState::Approved),
            "REJECTED" => Ok(ApprovalState::Rejected),
            other => Err(anyhow::anyhow!("unknown approval state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    New,
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
    Blocked,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::New => "NEW",
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Timeout => "TIMEOUT",
            ExecutionStatus::Blocked => "BLOCKED",
        }
    }

    /// Terminal states are absorbing: once set, no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
                | ExecutionStatus::Blocked
        )
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(ExecutionStatus::New),
            "QUEUED" => Ok(ExecutionStatus::Queued),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            "TIMEOUT" => Ok(ExecutionStatus::Timeout),
            "BLOCKED" => Ok(ExecutionStatus::Blocked),
            other => Err(anyhow::anyhow!("unknown execution status: {other}")),
        }
    }
}

/// Payload of one broker message on the `default` queue.
///
/// PUBLISH_OUTBOX is beat-scheduled; PLAN_JOB is fanned out by the outbox
/// publisher; RUN_EXECUTION is fanned out by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task")]
pub enum TaskMessage {
    #[serde(rename = "PUBLISH_OUTBOX")]
    PublishOutbox,
    #[serde(rename = "PLAN_JOB")]
    PlanJob { job_id: Uuid },
    #[serde(rename = "RUN_EXECUTION")]
    RunExecution { execution_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Opaque token the consumer hands back to `ack` or `requeue`.
    pub ack_token: String,

    /// Broker message id, for log correlation.
    pub message_id: String,

    pub queue_name: String,
    pub payload: Value,

    /// How many times this message has been handed to a consumer, this
    /// delivery included. The runner derives its broker retry count from it.
    pub deliveries: i32,
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(&self, queue: &str, payload: Value) -> anyhow::Result<String>;

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> anyhow::Result<Vec<QueueMessage>>;

    async fn ack(&self, ack_token: &str) -> anyhow::Result<()>;

    /// Put the message back with an explicit countdown; it redelivers once
    /// the delay lapses.
    async fn requeue(&self, ack_token: &str, delay: Duration) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_required_set_matches_command_types() {
        assert!(!CommandType::Ping.requires_approval());
        assert!(CommandType::RestartService.requires_approval());
        assert!(CommandType::Deploy.requires_approval());
        assert!(CommandType::RunScript.requires_approval());
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            ExecutionStatus::New,
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Timeout,
            ExecutionStatus::Blocked,
        ] {
            assert_eq!(s.as_str().parse::<ExecutionStatus>().unwrap(), s);
        }
        assert!("BOGUS".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn task_message_wire_format() {
        let msg = TaskMessage::PlanJob {
            job_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["task"], "PLAN_JOB");
        assert_eq!(json["job_id"], Uuid::nil().to_string());

        let beat = serde_json::to_value(TaskMessage::PublishOutbox).unwrap();
        assert_eq!(beat, serde_json::json!({ "task": "PUBLISH_OUTBOX" }));
    }
}
