//! Background reconciler for stuck work.
//!
//! Each tick: fail queued runs past their deadline, reclaim expired leases
//! (requeue or fail), prune worker sessions with stale heartbeats,
//! reconcile the in-memory claim map against the store (store wins), and
//! run a notification retry pass. Every step is independently fallible;
//! one failing step never stops the others, and the loop never exits on
//! error.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::AppState;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub stuck_timeout: Duration,
    pub notification_retry_batch: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_timeout: Duration::from_secs(300),
            notification_retry_batch: 10,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReaperStats {
    pub expired_deadlines: u64,
    pub requeued: usize,
    pub failed: usize,
    pub pruned_workers: usize,
    pub reconciled_claims: usize,
    pub notifications_retried: usize,
}

pub async fn reaper_loop(
    state: Arc<AppState>,
    cfg: ReaperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(
        event = "relay.reaper.started",
        interval_secs = cfg.interval.as_secs(),
        stuck_timeout_secs = cfg.stuck_timeout.as_secs(),
        "reaper started"
    );

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        match reap_once(&state, &cfg).await {
            Ok(stats) => {
                if stats.requeued > 0 || stats.failed > 0 || stats.expired_deadlines > 0 {
                    tracing::info!(
                        event = "relay.reaper.tick",
                        requeued = stats.requeued,
                        failed = stats.failed,
                        expired_deadlines = stats.expired_deadlines,
                        reconciled = stats.reconciled_claims,
                        "reaper recovered work"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    event = "relay.reaper.error",
                    error = %err,
                    "reaper tick failed"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

pub async fn reap_once(state: &AppState, cfg: &ReaperConfig) -> anyhow::Result<ReaperStats> {
    let mut stats = ReaperStats::default();
    let store = state.queue.store();

    stats.expired_deadlines = store.expire_overdue_task_runs().await?;

    let reclaimed = store.reclaim_expired_task_runs().await?;
    for run in &reclaimed {
        state.registry.clear_claim(run.run_id);

        if run.requeued {
            stats.requeued += 1;
            // Surface the run to connected workers again; polling workers
            // pick it up regardless.
            match state.queue.get_task(run.task_id).await {
                Ok(Some(task)) => {
                    if let Ok(Some(current)) = state.queue.get_run(run.run_id).await {
                        state.dispatcher.announce_run(&task, &current);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        event = "relay.reaper.announce_error",
                        run_id = %run.run_id,
                        error = %err,
                        "failed to re-announce requeued run"
                    );
                }
            }
        } else {
            stats.failed += 1;
            if let Err(err) = state.courier.deliver_for_run(run.run_id).await {
                tracing::warn!(
                    event = "relay.reaper.notify_error",
                    run_id = %run.run_id,
                    error = %err,
                    "failure notification delivery failed"
                );
            }
        }
    }

    let cutoff = Utc::now()
        - chrono::Duration::from_std(cfg.stuck_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
    stats.pruned_workers = state.registry.prune_stale(cutoff).len();

    stats.reconciled_claims = reconcile_claims(state).await?;

    stats.notifications_retried = state
        .courier
        .retry_pending(cfg.notification_retry_batch)
        .await?;

    Ok(stats)
}

/// Drop registry claims that the store does not corroborate. Divergence
/// happens when a lease expired and was reclaimed while the worker's SSE
/// session lived on.
async fn reconcile_claims(state: &AppState) -> anyhow::Result<usize> {
    let claims = state.registry.claims();
    if claims.is_empty() {
        return Ok(0);
    }

    let run_ids: Vec<_> = claims.iter().map(|(run_id, _)| *run_id).collect();
    let owners: HashMap<_, _> = state
        .queue
        .store()
        .lease_owners(&run_ids)
        .await?
        .into_iter()
        .collect();

    let mut cleared = 0;
    for (run_id, worker_id) in claims {
        let db_owner = owners.get(&run_id).and_then(|owner| owner.as_deref());
        if db_owner != Some(worker_id.as_str()) {
            state.registry.clear_claim(run_id);
            cleared += 1;
        }
    }
    Ok(cleared)
}
