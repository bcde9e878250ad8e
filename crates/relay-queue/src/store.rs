//! Lease and notification primitives over `task_runs`.
//!
//! Every operation here that claims to be atomic runs in a single statement
//! or an explicit transaction with `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers, the reaper, and the courier serialize on row locks rather than
//! in-memory coordination. In-memory registry state mirrors what these
//! functions decide; the database is always authoritative.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use relay_core::{NotificationChannel, TaskRun, TaskRunStatus, WorkerIdentity};

#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

/// Outcome of one reclaimed expired lease.
#[derive(Debug, Clone)]
pub struct ReclaimedRun {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub lease_owner: Option<String>,
    /// `true` when the run went back to `queued`; `false` when it was failed
    /// for exhausting its attempt budget.
    pub requeued: bool,
}

/// Notification rows due for a retry pass.
#[derive(Debug, Clone)]
pub struct NotificationRetry {
    pub run_id: Uuid,
    pub email_due: bool,
    pub webhook_due: bool,
}

/// Snapshot of one run's notification-relevant columns plus the task title.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub status: TaskRunStatus,
    pub notify_email: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub email_status: Option<relay_core::NotificationStatus>,
    pub webhook_status: Option<relay_core::NotificationStatus>,
    pub result_summary: Option<String>,
    pub result_full: Option<Value>,
    pub last_error: Option<String>,
    pub runtime_seconds: Option<i64>,
    pub title: Option<String>,
}

/// Quota check result for an enqueue candidate.
#[derive(Debug, Clone)]
pub struct LimitCheck {
    pub allowed: bool,
    pub message: String,
    pub tasks_used: i64,
    pub tasks_limit: i64,
    pub running_count: i64,
    pub concurrency_limit: i64,
}

/// Aggregate totals a stopping worker pool writes back to its row.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolTotals {
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub total_runtime_seconds: i64,
}

struct ChannelColumns {
    status: &'static str,
    attempts: &'static str,
    next_retry_at: &'static str,
    last_error: &'static str,
}

const fn channel_columns(channel: NotificationChannel) -> ChannelColumns {
    match channel {
        NotificationChannel::Email => ChannelColumns {
            status: "notification_status",
            attempts: "notification_attempts",
            next_retry_at: "notification_next_retry_at",
            last_error: "notification_last_error",
        },
        NotificationChannel::Webhook => ChannelColumns {
            status: "webhook_status",
            attempts: "webhook_attempts",
            next_retry_at: "webhook_next_retry_at",
            last_error: "webhook_last_error",
        },
    }
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Atomically claim the best `queued` run this worker is eligible for.
    ///
    /// Eligibility: not past deadline, agent-name match when the run is
    /// targeted, required capabilities a subset of the worker's, and the
    /// owning user under their concurrency cap. Tie-break is priority
    /// descending, then oldest first.
    pub async fn claim_next_task_run(
        &self,
        worker: &WorkerIdentity,
        lease_duration_secs: i64,
    ) -> anyhow::Result<Option<TaskRun>> {
        let caps = serde_json::to_value(&worker.capabilities).context("encode capabilities")?;
        let row = sqlx::query(&claim_sql(false))
            .bind(&worker.worker_id)
            .bind(&worker.agent_name)
            .bind(caps)
            .bind(lease_duration_secs)
            .fetch_optional(&self.pool)
            .await
            .context("claim next task run")?;

        row.as_ref().map(task_run_from_row).transpose()
    }

    /// Claim the latest `queued` run of one specific task (push path: the
    /// worker saw a `task_available` event and calls back with the task id).
    /// Routing constraints are re-checked against the row here; the event
    /// payload is never trusted for enforcement.
    pub async fn claim_task_run(
        &self,
        task_id: Uuid,
        worker: &WorkerIdentity,
        lease_duration_secs: i64,
    ) -> anyhow::Result<Option<TaskRun>> {
        let caps = serde_json::to_value(&worker.capabilities).context("encode capabilities")?;
        let row = sqlx::query(&claim_sql(true))
            .bind(&worker.worker_id)
            .bind(&worker.agent_name)
            .bind(caps)
            .bind(lease_duration_secs)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("claim task run by task id")?;

        row.as_ref().map(task_run_from_row).transpose()
    }

    /// Undo a claim whose in-memory mirror failed to record. Returns the run
    /// to `queued` and rolls the attempt counter back so the aborted claim
    /// does not burn retry budget.
    pub async fn unclaim_task_run(&self, run_id: Uuid, worker_id: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE task_runs
            SET status = 'queued',
                lease_owner = NULL,
                lease_expires_at = NULL,
                attempts = GREATEST(attempts - 1, 0),
                updated_at = now()
            WHERE id = $1
              AND lease_owner = $2
              AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .context("unclaim task run")?;

        Ok(res.rows_affected() == 1)
    }

    /// Extend the lease iff the caller still owns it. Returns `false` when
    /// the lease was stolen (reclaimed and re-claimed elsewhere); the worker
    /// must then abort its in-flight execution.
    pub async fn renew_task_run_lease(
        &self,
        run_id: Uuid,
        worker_id: &str,
        lease_duration_secs: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE task_runs
            SET lease_expires_at = now() + ($3::text || ' seconds')::interval,
                updated_at = now()
            WHERE id = $1
              AND lease_owner = $2
              AND status IN ('running', 'needs_input')
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(lease_duration_secs)
        .execute(&self.pool)
        .await
        .context("renew task run lease")?;

        Ok(res.rows_affected() == 1)
    }

    /// Move a run to a terminal status, requiring lease ownership. Clears
    /// the lease, stamps runtime, and arms notification state for any
    /// configured destination.
    pub async fn complete_task_run(
        &self,
        run_id: Uuid,
        worker_id: &str,
        status: TaskRunStatus,
        result_summary: Option<&str>,
        result_full: Option<&Value>,
        error: Option<&str>,
    ) -> anyhow::Result<bool> {
        if !status.is_terminal() {
            anyhow::bail!("complete_task_run requires a terminal status, got {}", status.as_str());
        }

        let error = error.map(relay_core::truncate_error);
        let res = sqlx::query(
            r#"
            UPDATE task_runs
            SET status = $3,
                result_summary = COALESCE($4, result_summary),
                result_full = COALESCE($5, result_full),
                last_error = COALESCE($6, last_error),
                completed_at = now(),
                runtime_seconds = CASE
                    WHEN started_at IS NOT NULL
                    THEN EXTRACT(EPOCH FROM (now() - started_at))::bigint
                    ELSE runtime_seconds
                END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                notification_status = CASE
                    WHEN notify_email IS NOT NULL THEN 'pending'
                    ELSE notification_status
                END,
                webhook_status = CASE
                    WHEN notify_webhook_url IS NOT NULL THEN 'pending'
                    ELSE webhook_status
                END,
                updated_at = now()
            WHERE id = $1
              AND lease_owner = $2
              AND status IN ('running', 'needs_input')
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(status.as_str())
        .bind(result_summary)
        .bind(result_full)
        .bind(error.as_deref())
        .execute(&self.pool)
        .await
        .context("complete task run")?;

        Ok(res.rows_affected() == 1)
    }

    /// Reclaim every `running` run whose lease has expired. Runs with
    /// attempt budget left go back to `queued` (attempt count preserved for
    /// the next claim); exhausted runs are failed. Safe to call from
    /// multiple processes concurrently.
    pub async fn reclaim_expired_task_runs(&self) -> anyhow::Result<Vec<ReclaimedRun>> {
        let mut tx = self.pool.begin().await.context("begin reclaim tx")?;

        let rows = sqlx::query(
            r#"
            SELECT id, task_id, lease_owner, attempts, max_attempts
            FROM task_runs
            WHERE status = 'running'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < now()
            LIMIT 50
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("select expired leases")?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let run_id: Uuid = row.try_get("id")?;
            let task_id: Uuid = row.try_get("task_id")?;
            let lease_owner: Option<String> = row.try_get("lease_owner")?;
            let attempts: i32 = row.try_get("attempts")?;
            let max_attempts: i32 = row.try_get("max_attempts")?;

            let requeued = attempts < max_attempts;
            if requeued {
                sqlx::query(
                    r#"
                    UPDATE task_runs
                    SET status = 'queued',
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("requeue run_id={run_id}"))?;
            } else {
                sqlx::query(
                    r#"
                    UPDATE task_runs
                    SET status = 'failed',
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        last_error = 'max attempts exceeded',
                        completed_at = now(),
                        notification_status = CASE
                            WHEN notify_email IS NOT NULL THEN 'pending'
                            ELSE notification_status
                        END,
                        webhook_status = CASE
                            WHEN notify_webhook_url IS NOT NULL THEN 'pending'
                            ELSE webhook_status
                        END,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("fail run_id={run_id}"))?;
            }

            reclaimed.push(ReclaimedRun {
                run_id,
                task_id,
                lease_owner,
                requeued,
            });
        }

        tx.commit().await.context("commit reclaim tx")?;
        Ok(reclaimed)
    }

    /// Fail `queued` runs whose routing deadline has passed.
    pub async fn expire_overdue_task_runs(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE task_runs
            SET status = 'failed',
                routing_failed_at = now(),
                routing_failure_reason = 'deadline exceeded',
                last_error = 'deadline exceeded',
                completed_at = now(),
                updated_at = now()
            WHERE status = 'queued'
              AND deadline_at IS NOT NULL
              AND deadline_at < now()
            "#,
        )
        .execute(&self.pool)
        .await
        .context("expire overdue task runs")?;

        Ok(res.rows_affected())
    }

    /// Check whether a user may enqueue another task, locking the user row
    /// so the subsequent insert + counter bump are race-free inside the
    /// caller's transaction.
    pub async fn check_user_task_limits(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: &str,
    ) -> anyhow::Result<Option<LimitCheck>> {
        let row = sqlx::query(
            r#"
            SELECT u.tasks_limit,
                   u.tasks_used_this_month,
                   u.concurrency_limit,
                   (
                     SELECT COUNT(*)
                     FROM task_runs r
                     WHERE r.user_id = u.id AND r.status = 'running'
                   ) AS running_count
            FROM users u
            WHERE u.id = $1
            FOR UPDATE OF u
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await
        .context("check user task limits")?;

        let Some(row) = row else {
            // No user row: unconstrained (internal/system callers).
            return Ok(None);
        };

        let tasks_limit: i64 = row.try_get::<i32, _>("tasks_limit")? as i64;
        let tasks_used: i64 = row.try_get::<i32, _>("tasks_used_this_month")? as i64;
        let concurrency_limit: i64 = row.try_get::<i32, _>("concurrency_limit")? as i64;
        let running_count: i64 = row.try_get("running_count")?;

        let (allowed, message) = if tasks_used >= tasks_limit {
            (
                false,
                format!("monthly task limit reached ({tasks_used}/{tasks_limit})"),
            )
        } else if running_count >= concurrency_limit {
            (
                false,
                format!("concurrency limit reached ({running_count}/{concurrency_limit})"),
            )
        } else {
            (true, String::new())
        };

        Ok(Some(LimitCheck {
            allowed,
            message,
            tasks_used,
            tasks_limit,
            running_count,
            concurrency_limit,
        }))
    }

    /// Atomic compare-and-set that makes one sender the exclusive owner of a
    /// notification attempt. Claims rows that are `pending` (first attempt
    /// after completion) or `failed` with a due retry; everything else --
    /// `sent`, `claimed`, not-yet-armed -- loses. This is the only
    /// mutual-exclusion point between the completion path and the retry
    /// loops.
    pub async fn claim_notification_for_send(
        &self,
        run_id: Uuid,
        channel: NotificationChannel,
        max_attempts: i32,
    ) -> anyhow::Result<bool> {
        let c = channel_columns(channel);
        let sql = format!(
            r#"
            UPDATE task_runs
            SET {status} = 'claimed',
                {attempts} = {attempts} + 1,
                updated_at = now()
            WHERE id = $1
              AND {attempts} < $2
              AND (
                {status} = 'pending'
                OR ({status} = 'failed' AND {next_retry} IS NOT NULL AND {next_retry} <= now())
              )
            "#,
            status = c.status,
            attempts = c.attempts,
            next_retry = c.next_retry_at,
        );

        let res = sqlx::query(&sql)
            .bind(run_id)
            .bind(max_attempts)
            .execute(&self.pool)
            .await
            .with_context(|| format!("claim {} notification", channel.as_str()))?;

        Ok(res.rows_affected() == 1)
    }

    /// Settle a claimed notification as delivered. Terminal.
    pub async fn mark_notification_sent(
        &self,
        run_id: Uuid,
        channel: NotificationChannel,
    ) -> anyhow::Result<bool> {
        let c = channel_columns(channel);
        let sql = format!(
            r#"
            UPDATE task_runs
            SET {status} = 'sent',
                {next_retry} = NULL,
                {last_error} = NULL,
                updated_at = now()
            WHERE id = $1
              AND {status} = 'claimed'
            "#,
            status = c.status,
            next_retry = c.next_retry_at,
            last_error = c.last_error,
        );

        let res = sqlx::query(&sql)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("mark {} notification sent", channel.as_str()))?;

        Ok(res.rows_affected() == 1)
    }

    /// Settle a claimed notification as failed. When the attempt budget has
    /// room, schedules the retry per the caller's backoff; otherwise the row
    /// latches `failed` with no retry time and is never claimed again.
    pub async fn mark_notification_failed(
        &self,
        run_id: Uuid,
        channel: NotificationChannel,
        error: &str,
        max_attempts: i32,
        retry_delay_secs: i64,
    ) -> anyhow::Result<bool> {
        let c = channel_columns(channel);
        let error = relay_core::truncate_error(error);
        let sql = format!(
            r#"
            UPDATE task_runs
            SET {status} = 'failed',
                {last_error} = $2,
                {next_retry} = CASE
                    WHEN {attempts} < $3
                    THEN now() + ($4::text || ' seconds')::interval
                    ELSE NULL
                END,
                updated_at = now()
            WHERE id = $1
              AND {status} = 'claimed'
            "#,
            status = c.status,
            attempts = c.attempts,
            next_retry = c.next_retry_at,
            last_error = c.last_error,
        );

        let res = sqlx::query(&sql)
            .bind(run_id)
            .bind(&error)
            .bind(max_attempts)
            .bind(retry_delay_secs)
            .execute(&self.pool)
            .await
            .with_context(|| format!("mark {} notification failed", channel.as_str()))?;

        Ok(res.rows_affected() == 1)
    }

    /// Current attempt count for a channel (used to derive the retry
    /// backoff for the attempt that just failed).
    pub async fn notification_attempts(
        &self,
        run_id: Uuid,
        channel: NotificationChannel,
    ) -> anyhow::Result<i32> {
        let c = channel_columns(channel);
        let sql = format!("SELECT {attempts} FROM task_runs WHERE id = $1", attempts = c.attempts);
        let attempts: i32 = sqlx::query_scalar(&sql)
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .context("read notification attempts")?;
        Ok(attempts)
    }

    /// Rows with at least one failed channel whose retry time has arrived.
    pub async fn get_pending_notification_retries(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> anyhow::Result<Vec<NotificationRetry>> {
        let rows = sqlx::query(
            r#"
            SELECT id,
                   (notify_email IS NOT NULL
                      AND notification_status = 'failed'
                      AND notification_attempts < $2
                      AND notification_next_retry_at IS NOT NULL
                      AND notification_next_retry_at <= now()) AS email_due,
                   (notify_webhook_url IS NOT NULL
                      AND webhook_status = 'failed'
                      AND webhook_attempts < $2
                      AND webhook_next_retry_at IS NOT NULL
                      AND webhook_next_retry_at <= now()) AS webhook_due
            FROM task_runs
            WHERE (notification_status = 'failed'
                     AND notification_attempts < $2
                     AND notification_next_retry_at IS NOT NULL
                     AND notification_next_retry_at <= now())
               OR (webhook_status = 'failed'
                     AND webhook_attempts < $2
                     AND webhook_next_retry_at IS NOT NULL
                     AND webhook_next_retry_at <= now())
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await
        .context("select pending notification retries")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(NotificationRetry {
                run_id: row.try_get("id")?,
                email_due: row.try_get("email_due")?,
                webhook_due: row.try_get("webhook_due")?,
            });
        }
        Ok(out)
    }

    /// Everything the courier needs to render and route notifications for
    /// one run.
    pub async fn notification_context(
        &self,
        run_id: Uuid,
    ) -> anyhow::Result<Option<NotificationContext>> {
        let row = sqlx::query(
            r#"
            SELECT tr.id, tr.task_id, tr.status,
                   tr.notify_email, tr.notify_webhook_url,
                   tr.notification_status, tr.webhook_status,
                   tr.result_summary, tr.result_full,
                   tr.last_error, tr.runtime_seconds,
                   t.title
            FROM task_runs tr
            LEFT JOIN tasks t ON tr.task_id = t.id
            WHERE tr.id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("select notification context")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_raw: String = row.try_get("status")?;
        let status = TaskRunStatus::parse(&status_raw)
            .with_context(|| format!("unknown task_run status `{status_raw}`"))?;

        let parse_channel = |raw: Option<String>| -> anyhow::Result<_> {
            raw.map(|raw| {
                relay_core::NotificationStatus::parse(&raw)
                    .with_context(|| format!("unknown notification status `{raw}`"))
            })
            .transpose()
        };

        Ok(Some(NotificationContext {
            run_id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            status,
            notify_email: row.try_get("notify_email")?,
            notify_webhook_url: row.try_get("notify_webhook_url")?,
            email_status: parse_channel(row.try_get("notification_status")?)?,
            webhook_status: parse_channel(row.try_get("webhook_status")?)?,
            result_summary: row.try_get("result_summary")?,
            result_full: row.try_get("result_full")?,
            last_error: row.try_get("last_error")?,
            runtime_seconds: row.try_get("runtime_seconds")?,
            title: row.try_get("title")?,
        }))
    }

    /// Lease owners of the given runs, restricted to leased statuses. Used
    /// by the reaper to reconcile the in-memory claim map (the store wins
    /// on divergence).
    pub async fn lease_owners(
        &self,
        run_ids: &[Uuid],
    ) -> anyhow::Result<Vec<(Uuid, Option<String>)>> {
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, lease_owner
            FROM task_runs
            WHERE id = ANY($1)
              AND status IN ('running', 'needs_input')
            "#,
        )
        .bind(run_ids)
        .fetch_all(&self.pool)
        .await
        .context("select lease owners")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("id")?, row.try_get("lease_owner")?));
        }
        Ok(out)
    }

    /// Upsert the pool's `workers` row on start. Re-registering a known pool
    /// id revives it.
    pub async fn register_worker_pool(
        &self,
        pool_id: &str,
        hostname: &str,
        process_id: i32,
        max_concurrent_tasks: i32,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, hostname, process_id, max_concurrent_tasks, status, started_at, last_heartbeat)
            VALUES ($1, $2, $3, $4, 'active', now(), now())
            ON CONFLICT (id) DO UPDATE SET
                status = 'active',
                hostname = EXCLUDED.hostname,
                process_id = EXCLUDED.process_id,
                max_concurrent_tasks = EXCLUDED.max_concurrent_tasks,
                last_heartbeat = now(),
                stopped_at = NULL
            "#,
        )
        .bind(pool_id)
        .bind(hostname)
        .bind(process_id)
        .bind(max_concurrent_tasks)
        .execute(&self.pool)
        .await
        .context("register worker pool")?;

        Ok(())
    }

    pub async fn heartbeat_worker_pool(
        &self,
        pool_id: &str,
        current_tasks: i32,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE workers
            SET last_heartbeat = now(),
                current_tasks = $2
            WHERE id = $1
            "#,
        )
        .bind(pool_id)
        .bind(current_tasks)
        .execute(&self.pool)
        .await
        .context("heartbeat worker pool")?;

        Ok(())
    }

    pub async fn stop_worker_pool(&self, pool_id: &str, totals: PoolTotals) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE workers
            SET status = 'stopped',
                stopped_at = now(),
                current_tasks = 0,
                tasks_completed = $2,
                tasks_failed = $3,
                total_runtime_seconds = $4
            WHERE id = $1
            "#,
        )
        .bind(pool_id)
        .bind(totals.tasks_completed)
        .bind(totals.tasks_failed)
        .bind(totals.total_runtime_seconds)
        .execute(&self.pool)
        .await
        .context("stop worker pool")?;

        Ok(())
    }
}

/// Shared claim statement. Both claim paths transition `queued -> running`,
/// stamp the lease, and bump the attempt counter in one statement; the
/// by-task variant adds a task filter and takes the newest matching run.
fn claim_sql(by_task: bool) -> String {
    let task_filter = if by_task { "AND tr.task_id = $5" } else { "" };
    let order = if by_task {
        "tr.created_at DESC"
    } else {
        "tr.priority DESC, tr.created_at ASC"
    };
    format!(
        r#"
        WITH candidate AS (
            SELECT tr.id
            FROM task_runs tr
            WHERE tr.status = 'queued'
              {task_filter}
              AND (tr.deadline_at IS NULL OR tr.deadline_at > now())
              AND NOT EXISTS (
                SELECT 1 FROM task_runs r3
                WHERE r3.task_id = tr.task_id AND r3.status = 'running'
              )
              AND (tr.target_agent_name IS NULL OR tr.target_agent_name = $2)
              AND (tr.required_capabilities IS NULL OR tr.required_capabilities <@ $3::jsonb)
              AND (
                tr.user_id IS NULL
                OR (
                  SELECT COUNT(*)
                  FROM task_runs r2
                  WHERE r2.user_id = tr.user_id AND r2.status = 'running'
                ) < COALESCE(
                  (SELECT u.concurrency_limit FROM users u WHERE u.id = tr.user_id),
                  2147483647
                )
              )
            ORDER BY {order}
            LIMIT 1
            FOR UPDATE OF tr SKIP LOCKED
        )
        UPDATE task_runs tr
        SET status = 'running',
            lease_owner = $1,
            lease_expires_at = now() + ($4::text || ' seconds')::interval,
            attempts = tr.attempts + 1,
            started_at = COALESCE(tr.started_at, now()),
            updated_at = now()
        FROM candidate
        WHERE tr.id = candidate.id
        RETURNING tr.*
        "#
    )
}

/// Map a `task_runs` row. Fails closed on unknown status strings.
pub fn task_run_from_row(row: &PgRow) -> anyhow::Result<TaskRun> {
    let status_raw: String = row.try_get("status")?;
    let status = TaskRunStatus::parse(&status_raw)
        .with_context(|| format!("unknown task_run status `{status_raw}`"))?;

    let required_capabilities: Option<Vec<String>> = row
        .try_get::<Option<Value>, _>("required_capabilities")?
        .map(serde_json::from_value)
        .transpose()
        .context("decode required_capabilities")?;

    Ok(TaskRun {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        user_id: row.try_get("user_id")?,
        status,
        priority: row.try_get("priority")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        runtime_seconds: row.try_get("runtime_seconds")?,
        result_summary: row.try_get("result_summary")?,
        result_full: row.try_get("result_full")?,
        notify_email: row.try_get("notify_email")?,
        notify_webhook_url: row.try_get("notify_webhook_url")?,
        email_state: channel_state_from_row(row, NotificationChannel::Email)?,
        webhook_state: channel_state_from_row(row, NotificationChannel::Webhook)?,
        target_agent_name: row.try_get("target_agent_name")?,
        required_capabilities,
        deadline_at: row.try_get("deadline_at")?,
        routing_failed_at: row.try_get("routing_failed_at")?,
        routing_failure_reason: row.try_get("routing_failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn channel_state_from_row(
    row: &PgRow,
    channel: NotificationChannel,
) -> anyhow::Result<relay_core::ChannelState> {
    let c = channel_columns(channel);
    let status_raw: Option<String> = row.try_get(c.status)?;
    let status = match status_raw {
        Some(raw) => Some(
            relay_core::NotificationStatus::parse(&raw)
                .with_context(|| format!("unknown {} status `{raw}`", channel.as_str()))?,
        ),
        None => None,
    };
    let next_retry_at: Option<DateTime<Utc>> = row.try_get(c.next_retry_at)?;

    Ok(relay_core::ChannelState {
        status,
        attempts: row.try_get(c.attempts)?,
        next_retry_at,
        last_error: row.try_get(c.last_error)?,
    })
}
