//! Durable task queue over Postgres.
//!
//! `task_runs` is the job queue: enqueue inserts a `queued` row, workers
//! claim rows under a lease, and terminal transitions settle results and
//! arm notifications. This crate is the only writer of queue state; the
//! in-memory worker registry in the server mirrors (never owns) claims.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use relay_core::task::EnqueueError;
use relay_core::{TaskLimitExceeded, TaskRun, TaskRunStatus};

pub mod store;

pub use store::{
    task_run_from_row, LimitCheck, NotificationContext, NotificationRetry, PoolTotals,
    ReclaimedRun, Store,
};

/// Enqueue parameters. `task_id` must reference an existing `tasks` row.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub task_id: Uuid,
    pub user_id: Option<String>,
    pub priority: i32,
    pub max_attempts: i32,
    pub target_agent_name: Option<String>,
    pub required_capabilities: Option<Vec<String>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub notify_email: Option<String>,
    pub notify_webhook_url: Option<String>,
    /// Bypass quota enforcement (internal/admin callers only).
    pub skip_limit_check: bool,
}

/// A `tasks` row as the queue sees it.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub title: Option<String>,
    pub prompt: String,
    pub status: String,
    pub model: Option<String>,
    pub metadata: Value,
}

/// Aggregate queue counters for operations dashboards.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub needs_input: i64,
    pub completed_24h: i64,
    pub failed_24h: i64,
    pub avg_runtime_seconds: f64,
    pub avg_wait_seconds: f64,
}

/// Notification-health counters over the last 24 hours.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NotificationStats {
    pub email_failed_ready: i64,
    pub email_pending_stuck: i64,
    pub webhook_failed_ready: i64,
    pub webhook_pending_stuck: i64,
    pub emails_sent_24h: i64,
    pub webhooks_sent_24h: i64,
}

/// Fleet-level worker pool counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerPoolStats {
    pub active_pools: i64,
    pub total_capacity: i64,
    pub current_load: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Everything an operations dashboard wants in one read.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FullQueueStatus {
    pub queue: QueueStats,
    pub notifications: NotificationStats,
    pub workers: WorkerPoolStats,
}

#[derive(Debug, Clone)]
pub struct TaskQueue {
    store: Store,
}

impl TaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            store: Store::new(pool),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Enqueue a run for a task. One transaction covers the quota check
    /// (user row locked), the insert, and the monthly-counter bump, so
    /// concurrent enqueues for the same user serialize and the counter never
    /// drifts from the inserted rows.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<TaskRun, EnqueueError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("begin enqueue tx")
            .map_err(EnqueueError::Other)?;

        if let Some(user_id) = req.user_id.as_deref() {
            if !req.skip_limit_check {
                let check = Store::check_user_task_limits(&mut tx, user_id)
                    .await
                    .map_err(EnqueueError::Other)?;
                if let Some(check) = check {
                    if !check.allowed {
                        return Err(EnqueueError::LimitExceeded(TaskLimitExceeded {
                            message: check.message,
                            tasks_used: check.tasks_used,
                            tasks_limit: check.tasks_limit,
                            running_count: check.running_count,
                            concurrency_limit: check.concurrency_limit,
                        }));
                    }
                }
            }
        }

        let run_id = Uuid::new_v4();
        // A non-positive attempt budget would fail the run on its first
        // reclaim; fall back to the schema default.
        let max_attempts = if req.max_attempts > 0 {
            req.max_attempts
        } else {
            2
        };
        let caps = req
            .required_capabilities
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("encode required_capabilities")
            .map_err(EnqueueError::Other)?;

        let row = sqlx::query(
            r#"
            INSERT INTO task_runs (
                id, task_id, user_id, status, priority, max_attempts,
                notify_email, notify_webhook_url,
                target_agent_name, required_capabilities, deadline_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, 'queued', $4, $5, $6, $7, $8, $9, $10, now(), now())
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(req.task_id)
        .bind(req.user_id.as_deref())
        .bind(req.priority)
        .bind(max_attempts)
        .bind(req.notify_email.as_deref())
        .bind(req.notify_webhook_url.as_deref())
        .bind(req.target_agent_name.as_deref())
        .bind(caps)
        .bind(req.deadline_at)
        .fetch_one(&mut *tx)
        .await
        .context("insert task run")
        .map_err(EnqueueError::Other)?;

        if let Some(user_id) = req.user_id.as_deref() {
            sqlx::query(
                r#"
                UPDATE users
                SET tasks_used_this_month = tasks_used_this_month + 1,
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("increment monthly task counter")
            .map_err(EnqueueError::Other)?;
        }

        tx.commit()
            .await
            .context("commit enqueue tx")
            .map_err(EnqueueError::Other)?;

        let run = task_run_from_row(&row).map_err(EnqueueError::Other)?;
        tracing::info!(
            event = "relay.queue.enqueued",
            run_id = %run.id,
            task_id = %run.task_id,
            priority = run.priority,
            target_agent = run.target_agent_name.as_deref().unwrap_or(""),
            "task run enqueued"
        );
        Ok(run)
    }

    pub async fn get_run(&self, run_id: Uuid) -> anyhow::Result<Option<TaskRun>> {
        let row = sqlx::query("SELECT * FROM task_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(self.pool())
            .await
            .context("select task run")?;
        row.as_ref().map(task_run_from_row).transpose()
    }

    /// Most recent run for a task.
    pub async fn get_run_by_task(&self, task_id: Uuid) -> anyhow::Result<Option<TaskRun>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM task_runs
            WHERE task_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await
        .context("select task run by task")?;
        row.as_ref().map(task_run_from_row).transpose()
    }

    /// Most recent run for an externally-submitted task, matched either on
    /// the task id itself or on the recorded external id in task metadata.
    pub async fn find_run_by_external_id(
        &self,
        external_id: &str,
    ) -> anyhow::Result<Option<TaskRun>> {
        let row = sqlx::query(
            r#"
            SELECT tr.*
            FROM task_runs tr
            JOIN tasks t ON tr.task_id = t.id
            WHERE t.id::text = $1
               OR t.metadata->>'external_task_id' = $1
            ORDER BY tr.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(external_id)
        .fetch_optional(self.pool())
        .await
        .context("select task run by external id")?;
        row.as_ref().map(task_run_from_row).transpose()
    }

    pub async fn list_runs(
        &self,
        user_id: Option<&str>,
        status: Option<TaskRunStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<TaskRun>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM task_runs
            WHERE ($1::text IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(status.map(TaskRunStatus::as_str))
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("list task runs")?;

        rows.iter().map(task_run_from_row).collect()
    }

    /// Cancel a run that has not been claimed yet. Returns `false` when the
    /// run already left `queued` (a running run completes normally from the
    /// queue's perspective).
    pub async fn cancel_run(&self, run_id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE task_runs
            SET status = 'cancelled',
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
              AND status = 'queued'
            "#,
        )
        .bind(run_id)
        .execute(self.pool())
        .await
        .context("cancel task run")?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn queue_stats(&self) -> anyhow::Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'needs_input') AS needs_input,
                COUNT(*) FILTER (WHERE status = 'completed' AND created_at > now() - interval '24 hours') AS completed_24h,
                COUNT(*) FILTER (WHERE status = 'failed' AND created_at > now() - interval '24 hours') AS failed_24h,
                COALESCE(AVG(runtime_seconds) FILTER (WHERE status = 'completed'), 0)::float8 AS avg_runtime,
                COALESCE(AVG(EXTRACT(EPOCH FROM (now() - created_at))) FILTER (WHERE status = 'queued'), 0)::float8 AS avg_wait
            FROM task_runs
            "#,
        )
        .fetch_one(self.pool())
        .await
        .context("select queue stats")?;

        Ok(QueueStats {
            queued: row.try_get("queued")?,
            running: row.try_get("running")?,
            needs_input: row.try_get("needs_input")?,
            completed_24h: row.try_get("completed_24h")?,
            failed_24h: row.try_get("failed_24h")?,
            avg_runtime_seconds: row.try_get("avg_runtime")?,
            avg_wait_seconds: row.try_get("avg_wait")?,
        })
    }

    /// Queue, notification, and worker-fleet counters in one read.
    pub async fn full_queue_status(&self) -> anyhow::Result<FullQueueStatus> {
        let queue = self.queue_stats().await?;

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE notification_status = 'failed'
                    AND notification_next_retry_at IS NOT NULL
                    AND notification_next_retry_at <= now()) AS email_failed_ready,
                COUNT(*) FILTER (WHERE notification_status = 'pending'
                    AND updated_at < now() - interval '5 minutes') AS email_pending_stuck,
                COUNT(*) FILTER (WHERE webhook_status = 'failed'
                    AND webhook_next_retry_at IS NOT NULL
                    AND webhook_next_retry_at <= now()) AS webhook_failed_ready,
                COUNT(*) FILTER (WHERE webhook_status = 'pending'
                    AND updated_at < now() - interval '5 minutes') AS webhook_pending_stuck,
                COUNT(*) FILTER (WHERE notification_status = 'sent') AS emails_sent,
                COUNT(*) FILTER (WHERE webhook_status = 'sent') AS webhooks_sent
            FROM task_runs
            WHERE created_at > now() - interval '24 hours'
            "#,
        )
        .fetch_one(self.pool())
        .await
        .context("select notification stats")?;

        let notifications = NotificationStats {
            email_failed_ready: row.try_get("email_failed_ready")?,
            email_pending_stuck: row.try_get("email_pending_stuck")?,
            webhook_failed_ready: row.try_get("webhook_failed_ready")?,
            webhook_pending_stuck: row.try_get("webhook_pending_stuck")?,
            emails_sent_24h: row.try_get("emails_sent")?,
            webhooks_sent_24h: row.try_get("webhooks_sent")?,
        };

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'active') AS active_pools,
                COALESCE(SUM(max_concurrent_tasks) FILTER (WHERE status = 'active'), 0)::bigint AS total_capacity,
                COALESCE(SUM(current_tasks) FILTER (WHERE status = 'active'), 0)::bigint AS current_load,
                MAX(last_heartbeat) AS last_heartbeat
            FROM workers
            "#,
        )
        .fetch_one(self.pool())
        .await
        .context("select worker stats")?;

        let workers = WorkerPoolStats {
            active_pools: row.try_get("active_pools")?,
            total_capacity: row.try_get("total_capacity")?,
            current_load: row.try_get("current_load")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        };

        Ok(FullQueueStatus {
            queue,
            notifications,
            workers,
        })
    }

    /// Locate-or-create the internal `tasks` row for an externally-submitted
    /// task. Idempotent on the external id: resubmitting the same id returns
    /// the existing task.
    pub async fn create_task_for_external(
        &self,
        external_id: &str,
        title: &str,
        prompt: &str,
        model: Option<&str>,
        extra_metadata: Option<&Value>,
    ) -> anyhow::Result<Uuid> {
        let mut tx = self.pool().begin().await.context("begin create task tx")?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM tasks
            WHERE id::text = $1
               OR metadata->>'external_task_id' = $1
            LIMIT 1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&mut *tx)
        .await
        .context("lookup task by external id")?;

        if let Some(id) = existing {
            tx.commit().await.context("commit create task tx")?;
            return Ok(id);
        }

        let mut metadata = match extra_metadata {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => serde_json::json!({}),
        };
        metadata["external_task_id"] = Value::String(external_id.to_string());

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, title, prompt, status, model, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, now(), now())
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(prompt)
        .bind(model)
        .bind(&metadata)
        .execute(&mut *tx)
        .await
        .context("insert task")?;

        tx.commit().await.context("commit create task tx")?;
        Ok(id)
    }

    pub async fn get_task(&self, task_id: Uuid) -> anyhow::Result<Option<TaskRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, prompt, status, model, metadata
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await
        .context("select task")?;

        row.map(|row| task_record_from_row(&row)).transpose()
    }
}

fn task_record_from_row(row: &PgRow) -> anyhow::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        prompt: row.try_get("prompt")?,
        status: row.try_get("status")?,
        model: row.try_get("model")?,
        metadata: row.try_get("metadata")?,
    })
}
