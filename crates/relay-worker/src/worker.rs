//! A single hosted worker: claim, execute, heartbeat, settle.
//!
//! The claim loop polls `claim_next_task_run`; a claimed run gets a
//! heartbeat task renewing the lease until execution settles. A failed
//! renewal means the lease was stolen: execution is aborted on the spot and
//! the run is left to its new owner (or the reaper). Every worker-side
//! failure ends in `complete_task_run(failed)`; no lease outlives a worker
//! error path.

use anyhow::Context;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use relay_core::runtime::{AgentOutcome, AgentRuntime, RuntimeError};
use relay_core::{TaskRun, TaskRunStatus, WorkerIdentity};
use relay_courier::Courier;
use relay_queue::Store;

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub tasks_completed: AtomicI64,
    pub tasks_failed: AtomicI64,
    pub total_runtime_seconds: AtomicI64,
}

pub struct HostedWorker {
    identity: WorkerIdentity,
    store: Store,
    runtime: Arc<dyn AgentRuntime>,
    courier: Arc<Courier>,
    poll_interval: Duration,
    lease_duration_secs: i64,
    heartbeat_interval: Duration,
    pub stats: WorkerStats,
    current_run: Mutex<Option<Uuid>>,
}

impl HostedWorker {
    pub fn new(
        identity: WorkerIdentity,
        store: Store,
        runtime: Arc<dyn AgentRuntime>,
        courier: Arc<Courier>,
        poll_interval: Duration,
        lease_duration_secs: i64,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            identity,
            store,
            runtime,
            courier,
            poll_interval,
            lease_duration_secs,
            heartbeat_interval,
            stats: WorkerStats::default(),
            current_run: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.identity.worker_id
    }

    pub fn current_run(&self) -> Option<Uuid> {
        *lock(&self.current_run)
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            event = "relay.worker.started",
            worker_id = %self.identity.worker_id,
            agent_name = %self.identity.agent_name,
            "worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                tracing::info!(
                    event = "relay.worker.stopped",
                    worker_id = %self.identity.worker_id,
                    "worker stopping"
                );
                return Ok(());
            }

            match self
                .store
                .claim_next_task_run(&self.identity, self.lease_duration_secs)
                .await
            {
                Ok(Some(run)) => {
                    if let Err(err) = self.execute_run(run).await {
                        tracing::warn!(
                            event = "relay.worker.execute.error",
                            worker_id = %self.identity.worker_id,
                            error = %err,
                            "run execution errored"
                        );
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        event = "relay.worker.claim.error",
                        worker_id = %self.identity.worker_id,
                        error = %err,
                        "claim failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
    }

    async fn execute_run(&self, run: TaskRun) -> anyhow::Result<()> {
        let run_id = run.id;
        let task_id = run.task_id;
        *lock(&self.current_run) = Some(run_id);
        let started = Instant::now();

        tracing::info!(
            event = "relay.worker.claimed",
            worker_id = %self.identity.worker_id,
            run_id = %run_id,
            task_id = %task_id,
            priority = run.priority,
            attempt = run.attempts,
            "run claimed"
        );

        let (lost_tx, lost_rx) = oneshot::channel();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            run_id,
            self.identity.worker_id.clone(),
            self.heartbeat_interval,
            self.lease_duration_secs,
            lost_tx,
        ));

        let outcome = tokio::select! {
            res = self.run_task(task_id) => Some(res),
            _ = lost_rx => None,
        };
        heartbeat.abort();

        let result = match outcome {
            None => {
                // Lease stolen mid-flight. The new owner (or the reaper)
                // owns the run now; completing here would fail the owner
                // check anyway.
                tracing::warn!(
                    event = "relay.worker.lease_lost",
                    worker_id = %self.identity.worker_id,
                    run_id = %run_id,
                    "lease lost, aborting execution"
                );
                *lock(&self.current_run) = None;
                return Ok(());
            }
            Some(result) => result,
        };

        let runtime_secs = started.elapsed().as_secs() as i64;
        match result {
            Ok(outcome) => {
                let settled = self
                    .store
                    .complete_task_run(
                        run_id,
                        &self.identity.worker_id,
                        TaskRunStatus::Completed,
                        Some(&outcome.summary),
                        Some(&outcome.full),
                        None,
                    )
                    .await?;
                if settled {
                    self.stats.tasks_completed.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .total_runtime_seconds
                        .fetch_add(runtime_secs, Ordering::Relaxed);
                    tracing::info!(
                        event = "relay.worker.completed",
                        worker_id = %self.identity.worker_id,
                        run_id = %run_id,
                        runtime_secs,
                        "run completed"
                    );
                }
            }
            Err(err) => {
                let settled = self
                    .store
                    .complete_task_run(
                        run_id,
                        &self.identity.worker_id,
                        TaskRunStatus::Failed,
                        None,
                        None,
                        Some(&format!("{err:#}")),
                    )
                    .await?;
                if settled {
                    self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event = "relay.worker.failed",
                        worker_id = %self.identity.worker_id,
                        run_id = %run_id,
                        error = %err,
                        "run failed"
                    );
                }
            }
        }

        *lock(&self.current_run) = None;

        if let Err(err) = self.courier.deliver_for_run(run_id).await {
            tracing::warn!(
                event = "relay.worker.notify.error",
                run_id = %run_id,
                error = %err,
                "notification delivery failed"
            );
        }

        Ok(())
    }

    async fn run_task(&self, task_id: Uuid) -> anyhow::Result<AgentOutcome> {
        let details = self
            .runtime
            .get_task(task_id)
            .await?
            .with_context(|| format!("task {task_id} not found in runtime"))?;

        let timeout = Duration::from_secs(self.lease_duration_secs.max(1) as u64);
        match self
            .runtime
            .continue_task(task_id, &details.prompt, timeout)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(RuntimeError::Timeout) => {
                // The runtime call outlived its deadline; the task may have
                // finished upstream regardless. Trust the runtime's word.
                let requeried = self.runtime.get_task(task_id).await?;
                if let Some(details) = requeried {
                    if details.status.as_deref() == Some("completed") {
                        return Ok(AgentOutcome {
                            summary: "Task completed (timeout during response)".to_string(),
                            full: serde_json::json!({
                                "summary": "Task completed (timeout during response)",
                                "title": details.title,
                                "status": details.status,
                            }),
                        });
                    }
                }
                Err(anyhow::anyhow!("task execution timed out"))
            }
            Err(RuntimeError::Other(err)) => Err(err.context("continue_task")),
        }
    }
}

async fn heartbeat_loop(
    store: Store,
    run_id: Uuid,
    worker_id: String,
    interval: Duration,
    lease_duration_secs: i64,
    lost_tx: oneshot::Sender<()>,
) {
    loop {
        tokio::time::sleep(interval).await;

        match store
            .renew_task_run_lease(run_id, &worker_id, lease_duration_secs)
            .await
        {
            Ok(true) => {
                tracing::debug!(
                    event = "relay.worker.lease_renewed",
                    run_id = %run_id,
                    "lease renewed"
                );
            }
            Ok(false) => {
                tracing::warn!(
                    event = "relay.worker.renew_refused",
                    run_id = %run_id,
                    worker_id = %worker_id,
                    "lease renewal refused"
                );
                let _ = lost_tx.send(());
                return;
            }
            // Transient store error: keep the task running and try again
            // next tick; the lease has slack for several missed renewals.
            Err(err) => {
                tracing::warn!(
                    event = "relay.worker.renew_error",
                    run_id = %run_id,
                    error = %err,
                    "lease renewal errored"
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
