//! Task-run records and queue-facing status types.
//!
//! The `task_runs` table is the job queue: one row per execution attempt
//! stream of a task, carrying lease state, routing constraints, and
//! per-channel notification state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Queued,
    Running,
    NeedsInput,
    Completed,
    Failed,
    Cancelled,
}

impl TaskRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskRunStatus::Queued => "queued",
            TaskRunStatus::Running => "running",
            TaskRunStatus::NeedsInput => "needs_input",
            TaskRunStatus::Completed => "completed",
            TaskRunStatus::Failed => "failed",
            TaskRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(TaskRunStatus::Queued),
            "running" => Some(TaskRunStatus::Running),
            "needs_input" => Some(TaskRunStatus::NeedsInput),
            "completed" => Some(TaskRunStatus::Completed),
            "failed" => Some(TaskRunStatus::Failed),
            "cancelled" => Some(TaskRunStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states cannot transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskRunStatus::Completed | TaskRunStatus::Failed | TaskRunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Claimed,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Claimed => "claimed",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(NotificationStatus::Pending),
            "claimed" => Some(NotificationStatus::Claimed),
            "sent" => Some(NotificationStatus::Sent),
            "failed" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

/// Delivery channels tracked per run. Each channel has its own
/// status/attempts/retry columns so email and webhook retries never
/// interfere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationChannel {
    Email,
    Webhook,
}

impl NotificationChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Webhook => "webhook",
        }
    }
}

/// Per-channel delivery state (`pending -> claimed -> sent | failed`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelState {
    pub status: Option<NotificationStatus>,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// One execution attempt stream of a task in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: Option<String>,

    pub status: TaskRunStatus,
    pub priority: i32,

    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub runtime_seconds: Option<i64>,

    pub result_summary: Option<String>,
    pub result_full: Option<Value>,

    pub notify_email: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub email_state: ChannelState,
    pub webhook_state: ChannelState,

    pub target_agent_name: Option<String>,
    pub required_capabilities: Option<Vec<String>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub routing_failed_at: Option<DateTime<Utc>>,
    pub routing_failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn channel_state(&self, channel: NotificationChannel) -> &ChannelState {
        match channel {
            NotificationChannel::Email => &self.email_state,
            NotificationChannel::Webhook => &self.webhook_state,
        }
    }
}

/// What a claiming worker declares about itself. Routing constraints on the
/// run (`target_agent_name`, `required_capabilities`) are checked against
/// this at claim time; the database row is authoritative, never the
/// notification payload a worker saw.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub agent_name: String,
    pub capabilities: Vec<String>,
}

/// Structured quota error returned by enqueue when a user is over their
/// monthly task budget or concurrency cap. Serialized verbatim to API
/// callers; never collapsed into a generic 500.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLimitExceeded {
    pub message: String,
    pub tasks_used: i64,
    pub tasks_limit: i64,
    pub running_count: i64,
    pub concurrency_limit: i64,
}

impl TaskLimitExceeded {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "error": "task_limit_exceeded",
            "message": self.message,
            "tasks_used": self.tasks_used,
            "tasks_limit": self.tasks_limit,
            "running_count": self.running_count,
            "concurrency_limit": self.concurrency_limit,
        })
    }
}

impl std::fmt::Display for TaskLimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskLimitExceeded {}

/// Error surface of `TaskQueue::enqueue`: either the structured quota
/// rejection (callers branch on it) or an operational failure.
#[derive(Debug)]
pub enum EnqueueError {
    LimitExceeded(TaskLimitExceeded),
    Other(anyhow::Error),
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::LimitExceeded(e) => e.fmt(f),
            EnqueueError::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for EnqueueError {}

impl From<anyhow::Error> for EnqueueError {
    fn from(value: anyhow::Error) -> Self {
        EnqueueError::Other(value)
    }
}

impl From<sqlx::Error> for EnqueueError {
    fn from(value: sqlx::Error) -> Self {
        EnqueueError::Other(anyhow::Error::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskRunStatus::Queued,
            TaskRunStatus::Running,
            TaskRunStatus::NeedsInput,
            TaskRunStatus::Completed,
            TaskRunStatus::Failed,
            TaskRunStatus::Cancelled,
        ] {
            assert_eq!(TaskRunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskRunStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskRunStatus::Completed.is_terminal());
        assert!(TaskRunStatus::Failed.is_terminal());
        assert!(TaskRunStatus::Cancelled.is_terminal());
        assert!(!TaskRunStatus::Queued.is_terminal());
        assert!(!TaskRunStatus::Running.is_terminal());
        assert!(!TaskRunStatus::NeedsInput.is_terminal());
    }

    #[test]
    fn limit_error_serializes_with_error_tag() {
        let err = TaskLimitExceeded {
            message: "monthly task limit reached".to_string(),
            tasks_used: 10,
            tasks_limit: 10,
            running_count: 0,
            concurrency_limit: 2,
        };
        let json = err.to_json();
        assert_eq!(json["error"], "task_limit_exceeded");
        assert_eq!(json["tasks_used"], 10);
        assert_eq!(json["concurrency_limit"], 2);
    }
}
