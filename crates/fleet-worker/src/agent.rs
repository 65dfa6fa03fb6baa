//! The per-host command executor seam.
//!
//! The real executor lives outside this system; [`SimulatedAgent`] stands in
//! for it with the failure distribution used during load exercises. Tests
//! inject deterministic implementations.

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::{fmt, time::Duration};

use fleet_core::CommandType;

#[derive(Debug, Clone, Serialize)]
pub struct AgentOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum AgentError {
    Timeout(String),
    Failed(String),
}

impl AgentError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Timeout(_))
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Timeout(msg) | AgentError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for AgentError {}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(
        &self,
        hostname: &str,
        command: CommandType,
        payload: &Value,
    ) -> Result<AgentOutput, AgentError>;
}

/// Simulated agent: ~50% timeout, ~15% failure, success otherwise after a
/// short pause.
pub struct SimulatedAgent;

#[async_trait]
impl Agent for SimulatedAgent {
    async fn run(
        &self,
        _hostname: &str,
        _command: CommandType,
        _payload: &Value,
    ) -> Result<AgentOutput, AgentError> {
        let p: f64 = rand::thread_rng().gen();
        if p > 0.5 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return Err(AgentError::Timeout("agent timeout".to_string()));
        }
        if p < 0.15 {
            return Err(AgentError::Failed("agent error".to_string()));
        }

        let pause = rand::thread_rng().gen_range(0.1..1.5);
        tokio::time::sleep(Duration::from_secs_f64(pause)).await;
        Ok(AgentOutput {
            exit_code: 0,
            stdout: "ok".to_string(),
            stderr: String::new(),
        })
    }
}
