//! Agent-runtime contract.
//!
//! The downstream agent runtime is an opaque RPC: it accepts a task id and
//! prompt and eventually produces a result. Workers never interpret the
//! bytes beyond lifting out a display summary. Timeouts are a distinct
//! error kind because the caller reacts differently: it re-queries task
//! state before deciding the attempt failed.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Task details as fetched from the runtime before execution.
#[derive(Debug, Clone)]
pub struct TaskDetails {
    pub task_id: Uuid,
    pub title: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub status: Option<String>,
}

/// Result of a runtime invocation. `full` is passed through untouched
/// (possibly NDJSON stream output re-wrapped as JSON).
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub summary: String,
    pub full: Value,
}

#[derive(Debug)]
pub enum RuntimeError {
    /// The invocation outlived its deadline. The task may still have
    /// completed upstream.
    Timeout,
    Other(anyhow::Error),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Timeout => write!(f, "agent runtime call timed out"),
            RuntimeError::Other(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<anyhow::Error> for RuntimeError {
    fn from(value: anyhow::Error) -> Self {
        RuntimeError::Other(value)
    }
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Fetch task details. `Ok(None)` means the runtime does not know the task.
    async fn get_task(&self, task_id: Uuid) -> anyhow::Result<Option<TaskDetails>>;

    /// Drive the task to completion, bounded by `timeout`.
    async fn continue_task(
        &self,
        task_id: Uuid,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AgentOutcome, RuntimeError>;
}
