//! External-protocol adapter: executes A2A verbs against the internal queue.
//!
//! `execute` turns an inbound request into an internal task + queued run,
//! pushes a `task_available` notification, then polls the run and streams
//! status transitions (and a result artifact) back through the injected
//! [`EventSink`]. `cancel` only succeeds for runs still `queued`; a running
//! run completes normally from the queue's perspective.

use anyhow::Context;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use relay_core::a2a::{
    extract_prompt, A2aArtifact, A2aEvent, A2aState, EventSink, Part, RequestContext,
};
use relay_core::task::EnqueueError;
use relay_core::{TaskRun, TaskRunStatus};
use relay_queue::{EnqueueRequest, TaskQueue, TaskRecord};

use crate::dispatch::Dispatcher;

#[derive(Debug, Clone)]
pub struct A2aConfig {
    pub default_user_id: Option<String>,
    pub default_priority: i32,
    pub default_model: String,
    pub max_attempts: i32,
    pub poll_interval: Duration,
    pub max_poll_duration: Duration,
    pub renotify_interval: Duration,
}

impl Default for A2aConfig {
    fn default() -> Self {
        Self {
            default_user_id: None,
            default_priority: 0,
            default_model: "anthropic:claude-sonnet".to_string(),
            max_attempts: 3,
            poll_interval: Duration::from_secs(1),
            max_poll_duration: Duration::from_secs(120),
            renotify_interval: Duration::from_secs(5),
        }
    }
}

/// Routing metadata lifted from the request + message metadata objects.
/// Message metadata wins on key collisions.
#[derive(Debug, Default, Clone)]
struct RoutingMeta {
    user_id: Option<String>,
    priority: Option<i32>,
    target_agent_name: Option<String>,
    required_capabilities: Option<Vec<String>>,
    model_ref: Option<String>,
}

pub struct A2aExecutor {
    queue: TaskQueue,
    dispatcher: Dispatcher,
    cfg: A2aConfig,
}

impl A2aExecutor {
    pub fn new(queue: TaskQueue, dispatcher: Dispatcher, cfg: A2aConfig) -> Self {
        Self {
            queue,
            dispatcher,
            cfg,
        }
    }

    pub async fn execute(
        &self,
        ctx: &RequestContext,
        sink: &dyn EventSink,
    ) -> anyhow::Result<()> {
        let external_id = ctx.task_id.as_str();
        tracing::info!(
            event = "relay.a2a.execute",
            task_id = external_id,
            "executing external request"
        );

        let prompt = extract_prompt(&ctx.message);
        if prompt.is_empty() {
            sink.put(A2aEvent::final_status(
                external_id,
                A2aState::Failed,
                "message must contain at least one text part",
            ))
            .await?;
            return Ok(());
        }

        let meta = extract_routing_meta(ctx);
        let user_id = meta.user_id.clone().or(self.cfg.default_user_id.clone());
        let priority = meta.priority.unwrap_or(self.cfg.default_priority);
        let model = meta
            .model_ref
            .clone()
            .unwrap_or_else(|| self.cfg.default_model.clone());

        let title = format!("A2A task {}", short_external_id(external_id));
        let task_id = self
            .queue
            .create_task_for_external(
                external_id,
                &title,
                &prompt,
                Some(&model),
                ctx.metadata.as_ref(),
            )
            .await
            .context("create internal task")?;

        let enqueue = EnqueueRequest {
            task_id,
            user_id,
            priority,
            max_attempts: self.cfg.max_attempts,
            target_agent_name: meta.target_agent_name.clone(),
            required_capabilities: meta.required_capabilities.clone(),
            ..Default::default()
        };

        let run = match self.queue.enqueue(enqueue).await {
            Ok(run) => run,
            Err(EnqueueError::LimitExceeded(limit)) => {
                tracing::warn!(
                    event = "relay.a2a.limit_exceeded",
                    task_id = external_id,
                    "task limit exceeded"
                );
                sink.put(A2aEvent::final_status(
                    external_id,
                    A2aState::Failed,
                    format!("{} ({})", limit.message, limit.to_json()),
                ))
                .await?;
                return Ok(());
            }
            Err(EnqueueError::Other(err)) => return Err(err.context("enqueue task run")),
        };

        let task = self
            .queue
            .get_task(task_id)
            .await?
            .with_context(|| format!("task {task_id} vanished after enqueue"))?;

        let notified = self.dispatcher.announce_run(&task, &run);
        tracing::info!(
            event = "relay.a2a.announced",
            run_id = %run.id,
            notified = notified.len(),
            "workers notified of new run"
        );

        sink.put(A2aEvent::status(
            external_id,
            A2aState::Working,
            "Task queued for processing",
        ))
        .await?;

        self.poll_and_stream(external_id, &task, run, sink).await
    }

    pub async fn cancel(&self, ctx: &RequestContext, sink: &dyn EventSink) -> anyhow::Result<()> {
        let external_id = ctx.task_id.as_str();
        tracing::info!(
            event = "relay.a2a.cancel",
            task_id = external_id,
            "cancelling external task"
        );

        let run = self
            .queue
            .find_run_by_external_id(external_id)
            .await
            .context("lookup run for cancel")?;
        let Some(run) = run else {
            sink.put(A2aEvent::final_status(
                external_id,
                A2aState::Failed,
                format!("no task found with id {external_id}"),
            ))
            .await?;
            return Ok(());
        };

        if run.status.is_terminal() {
            sink.put(A2aEvent::final_status(
                external_id,
                map_status(run.status),
                format!("Task already {}", run.status.as_str()),
            ))
            .await?;
            return Ok(());
        }

        if self.queue.cancel_run(run.id).await? {
            sink.put(A2aEvent::final_status(
                external_id,
                A2aState::Cancelled,
                "Task cancelled successfully",
            ))
            .await?;
        } else {
            sink.put(A2aEvent::status(
                external_id,
                A2aState::Working,
                "Task is currently running and cannot be cancelled",
            ))
            .await?;
        }
        Ok(())
    }

    /// Poll the run until it settles, the poll budget runs out, or the sink
    /// goes away. Emits one status event per observed transition; queued
    /// runs are re-announced every `renotify_interval` to recover from
    /// claim/release cycles where no worker kept the task.
    async fn poll_and_stream(
        &self,
        external_id: &str,
        task: &TaskRecord,
        run: TaskRun,
        sink: &dyn EventSink,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let mut last_renotify = Instant::now();
        let mut last_status = run.status;
        let run_id = run.id;

        loop {
            if started.elapsed() > self.cfg.max_poll_duration {
                tracing::warn!(
                    event = "relay.a2a.poll_timeout",
                    run_id = %run_id,
                    elapsed_secs = started.elapsed().as_secs(),
                    "poll budget exhausted"
                );
                sink.put(A2aEvent::final_status(
                    external_id,
                    A2aState::Failed,
                    format!(
                        "Task timed out after {}s",
                        self.cfg.max_poll_duration.as_secs()
                    ),
                ))
                .await?;
                return Ok(());
            }

            let Some(current) = self.queue.get_run(run_id).await? else {
                sink.put(A2aEvent::final_status(
                    external_id,
                    A2aState::Failed,
                    "task run not found",
                ))
                .await?;
                return Ok(());
            };

            if current.status != last_status {
                last_status = current.status;

                if current.status.is_terminal() {
                    if let Some(summary) = current.result_summary.as_deref() {
                        sink.put(result_artifact(
                            external_id,
                            summary,
                            current.result_full.as_ref(),
                        ))
                        .await?;
                    }
                    sink.put(A2aEvent::final_status(
                        external_id,
                        map_status(current.status),
                        status_message(&current),
                    ))
                    .await?;
                    return Ok(());
                }

                sink.put(A2aEvent::status(
                    external_id,
                    map_status(current.status),
                    status_message(&current),
                ))
                .await?;
            }

            if current.status == TaskRunStatus::Queued
                && last_renotify.elapsed() >= self.cfg.renotify_interval
            {
                last_renotify = Instant::now();
                let notified = self.dispatcher.announce_run(task, &current);
                tracing::debug!(
                    event = "relay.a2a.renotified",
                    run_id = %run_id,
                    notified = notified.len(),
                    "re-announced queued run"
                );
            }

            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }
}

fn result_artifact(external_id: &str, summary: &str, full: Option<&Value>) -> A2aEvent {
    let mut parts = vec![Part::Text {
        text: summary.to_string(),
    }];
    if let Some(full) = full {
        parts.push(Part::Data {
            data: full.clone(),
            mime_type: Some("application/json".to_string()),
        });
    }
    A2aEvent::Artifact {
        task_id: external_id.to_string(),
        artifact: A2aArtifact {
            artifact_id: Uuid::new_v4().to_string(),
            name: "result".to_string(),
            parts,
        },
        final_event: false,
    }
}

fn map_status(status: TaskRunStatus) -> A2aState {
    match status {
        TaskRunStatus::Queued => A2aState::Submitted,
        TaskRunStatus::Running => A2aState::Working,
        TaskRunStatus::NeedsInput => A2aState::InputRequired,
        TaskRunStatus::Completed => A2aState::Completed,
        TaskRunStatus::Failed => A2aState::Failed,
        TaskRunStatus::Cancelled => A2aState::Cancelled,
    }
}

fn status_message(run: &TaskRun) -> String {
    match run.status {
        TaskRunStatus::Queued => "Task is queued for processing".to_string(),
        TaskRunStatus::Running => "Task is being processed by a worker".to_string(),
        TaskRunStatus::NeedsInput => "Task requires additional input".to_string(),
        TaskRunStatus::Completed => "Task completed successfully".to_string(),
        TaskRunStatus::Failed => run
            .last_error
            .clone()
            .unwrap_or_else(|| "Task failed".to_string()),
        TaskRunStatus::Cancelled => "Task was cancelled".to_string(),
    }
}

fn short_external_id(external_id: &str) -> String {
    external_id.chars().take(8).collect()
}

fn extract_routing_meta(ctx: &RequestContext) -> RoutingMeta {
    let mut merged = serde_json::Map::new();
    if let Some(Value::Object(map)) = ctx.metadata.as_ref() {
        merged.extend(map.clone());
    }
    if let Some(Value::Object(map)) = ctx.message.metadata.as_ref() {
        merged.extend(map.clone());
    }

    RoutingMeta {
        user_id: meta_string(&merged, "user_id"),
        priority: merged
            .get("priority")
            .and_then(Value::as_i64)
            .map(|p| p.clamp(i32::MIN as i64, i32::MAX as i64) as i32),
        target_agent_name: meta_string(&merged, "target_agent_name"),
        required_capabilities: merged.get("required_capabilities").and_then(|v| {
            v.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
        }),
        model_ref: meta_string(&merged, "model_ref"),
    }
}

fn meta_string(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::a2a::A2aMessage;

    fn context_with_meta(request: Value, message: Value) -> RequestContext {
        RequestContext {
            task_id: "ext-1".to_string(),
            message: A2aMessage {
                role: Some("user".to_string()),
                parts: vec![Part::Text {
                    text: "do it".to_string(),
                }],
                metadata: Some(message),
            },
            metadata: Some(request),
        }
    }

    #[test]
    fn message_metadata_overrides_request_metadata() {
        let ctx = context_with_meta(
            serde_json::json!({"user_id": "u-request", "priority": 1}),
            serde_json::json!({"user_id": "u-message"}),
        );
        let meta = extract_routing_meta(&ctx);
        assert_eq!(meta.user_id.as_deref(), Some("u-message"));
        assert_eq!(meta.priority, Some(1));
    }

    #[test]
    fn capabilities_parse_from_metadata_array() {
        let ctx = context_with_meta(
            serde_json::json!({"required_capabilities": ["coding", "testing"]}),
            serde_json::json!({}),
        );
        let meta = extract_routing_meta(&ctx);
        assert_eq!(
            meta.required_capabilities,
            Some(vec!["coding".to_string(), "testing".to_string()])
        );
    }

    #[test]
    fn status_mapping_covers_all_internal_states() {
        assert_eq!(map_status(TaskRunStatus::Queued), A2aState::Submitted);
        assert_eq!(map_status(TaskRunStatus::Running), A2aState::Working);
        assert_eq!(map_status(TaskRunStatus::NeedsInput), A2aState::InputRequired);
        assert_eq!(map_status(TaskRunStatus::Completed), A2aState::Completed);
        assert_eq!(map_status(TaskRunStatus::Failed), A2aState::Failed);
        assert_eq!(map_status(TaskRunStatus::Cancelled), A2aState::Cancelled);
    }

    #[test]
    fn failed_status_message_carries_last_error() {
        let mut run = sample_run();
        run.status = TaskRunStatus::Failed;
        run.last_error = Some("agent exploded".to_string());
        assert_eq!(status_message(&run), "agent exploded");

        run.last_error = None;
        assert_eq!(status_message(&run), "Task failed");
    }

    fn sample_run() -> TaskRun {
        TaskRun {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            user_id: None,
            status: TaskRunStatus::Queued,
            priority: 0,
            lease_owner: None,
            lease_expires_at: None,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            started_at: None,
            completed_at: None,
            runtime_seconds: None,
            result_summary: None,
            result_full: None,
            notify_email: None,
            notify_webhook_url: None,
            email_state: Default::default(),
            webhook_state: Default::default(),
            target_agent_name: None,
            required_capabilities: None,
            deadline_at: None,
            routing_failed_at: None,
            routing_failure_reason: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }
}
