//! In-memory registry of workers connected over SSE.
//!
//! The registry owns live-session state only: connected workers, their
//! outbound mailboxes, and the run -> worker claim map. Authoritative lease
//! state lives in the store; when the two disagree the store wins and the
//! registry entry is cleared (see the reaper's reconcile pass).
//!
//! One exclusive lock guards both maps. Critical sections are map
//! reads/writes and non-blocking mailbox pushes; no I/O happens under the
//! lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Codebase tags that match any worker regardless of its affinity set.
pub const RESERVED_CODEBASE_TAGS: [&str; 2] = ["global", "__pending__"];

/// Mailbox depth per worker. A full mailbox drops the notification for that
/// worker (logged); the task stays claimable by others.
const MAILBOX_CAPACITY: usize = 32;

/// Payload of a `task_available` push. Routing fields are informational for
/// the worker; claim-time enforcement always re-reads the database row.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAnnouncement {
    pub id: Uuid,
    pub title: String,
    pub prompt: String,
    pub model: Option<String>,
    pub priority: i32,
    pub codebase_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_capabilities: Option<Vec<String>>,
}

struct LiveWorker {
    agent_name: String,
    session_token: Uuid,
    sender: mpsc::Sender<TaskAnnouncement>,
    capabilities: Vec<String>,
    codebases: HashSet<String>,
    is_busy: bool,
    current_run_id: Option<Uuid>,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

/// Read-only view of a live worker for listings and claim handling.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub agent_name: String,
    pub capabilities: Vec<String>,
    pub codebases: Vec<String>,
    pub is_busy: bool,
    pub current_run_id: Option<Uuid>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    workers: HashMap<String, LiveWorker>,
    claims: HashMap<Uuid, String>,
}

#[derive(Default)]
pub struct WorkerRegistry {
    inner: Mutex<Inner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker session and hand back its mailbox receiver plus a
    /// session token. Re-registering an id replaces the previous session;
    /// the old mailbox sender is dropped, which ends the old stream, and the
    /// old session's token no longer unregisters anything.
    pub fn register(
        &self,
        worker_id: &str,
        agent_name: &str,
        capabilities: Vec<String>,
        codebases: HashSet<String>,
    ) -> (mpsc::Receiver<TaskAnnouncement>, Uuid) {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let now = Utc::now();
        let session_token = Uuid::new_v4();

        let total = {
            let mut inner = lock(&self.inner);
            inner.workers.insert(
                worker_id.to_string(),
                LiveWorker {
                    agent_name: agent_name.to_string(),
                    session_token,
                    sender,
                    capabilities,
                    codebases,
                    is_busy: false,
                    current_run_id: None,
                    connected_at: now,
                    last_heartbeat: now,
                },
            );
            inner.workers.len()
        };

        tracing::info!(
            event = "relay.registry.connected",
            worker_id,
            agent_name,
            total_connected = total,
            "worker connected"
        );
        (receiver, session_token)
    }

    /// Unregister only when the caller's session is still the live one.
    /// Used by stream teardown so a replaced session cannot evict its
    /// replacement.
    pub fn unregister_session(&self, worker_id: &str, session_token: Uuid) -> bool {
        let still_current = {
            let inner = lock(&self.inner);
            inner
                .workers
                .get(worker_id)
                .is_some_and(|worker| worker.session_token == session_token)
        };
        if !still_current {
            return false;
        }
        self.unregister(worker_id)
    }

    /// Remove a worker session and drop every claim it held. The dropped
    /// claims resurface through the reaper / lease expiry; nothing is
    /// released in the store here.
    pub fn unregister(&self, worker_id: &str) -> bool {
        let (removed, dropped_claims, total) = {
            let mut inner = lock(&self.inner);
            let removed = inner.workers.remove(worker_id);
            let dropped: Vec<Uuid> = inner
                .claims
                .iter()
                .filter(|(_, owner)| owner.as_str() == worker_id)
                .map(|(run_id, _)| *run_id)
                .collect();
            for run_id in &dropped {
                inner.claims.remove(run_id);
            }
            (removed.is_some(), dropped, inner.workers.len())
        };

        if removed {
            for run_id in &dropped_claims {
                tracing::warn!(
                    event = "relay.registry.claim_dropped",
                    worker_id,
                    run_id = %run_id,
                    "claim dropped on worker disconnect"
                );
            }
            tracing::info!(
                event = "relay.registry.disconnected",
                worker_id,
                total_connected = total,
                "worker disconnected"
            );
        }
        removed
    }

    pub fn update_heartbeat(&self, worker_id: &str) -> bool {
        let mut inner = lock(&self.inner);
        match inner.workers.get_mut(worker_id) {
            Some(worker) => {
                worker.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn update_codebases(&self, worker_id: &str, codebases: HashSet<String>) -> bool {
        let mut inner = lock(&self.inner);
        match inner.workers.get_mut(worker_id) {
            Some(worker) => {
                worker.codebases = codebases;
                true
            }
            None => false,
        }
    }

    /// In-memory mirror of the SQL claim. Idempotent for the same worker;
    /// refuses a run already claimed by someone else or a worker that is
    /// not connected. Callers performing the SQL claim first must roll it
    /// back when this returns `false`.
    pub fn claim(&self, run_id: Uuid, worker_id: &str) -> bool {
        let mut inner = lock(&self.inner);

        if let Some(owner) = inner.claims.get(&run_id) {
            return owner == worker_id;
        }
        let Some(worker) = inner.workers.get_mut(worker_id) else {
            return false;
        };

        worker.is_busy = true;
        worker.current_run_id = Some(run_id);
        inner.claims.insert(run_id, worker_id.to_string());
        tracing::info!(
            event = "relay.registry.claimed",
            run_id = %run_id,
            worker_id,
            "run claimed"
        );
        true
    }

    /// Clear a claim and mark the worker idle. `false` when the claim is
    /// not held by this worker.
    pub fn release(&self, run_id: Uuid, worker_id: &str) -> bool {
        let mut inner = lock(&self.inner);

        if inner.claims.get(&run_id).map(String::as_str) != Some(worker_id) {
            return false;
        }
        inner.claims.remove(&run_id);
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.is_busy = false;
            worker.current_run_id = None;
        }
        tracing::info!(
            event = "relay.registry.released",
            run_id = %run_id,
            worker_id,
            "run released"
        );
        true
    }

    /// Drop a claim regardless of owner (reaper path: the store has already
    /// requeued or failed the run). Resets the owning worker's busy flag
    /// when it is still connected with that run.
    pub fn clear_claim(&self, run_id: Uuid) -> Option<String> {
        let mut inner = lock(&self.inner);
        let owner = inner.claims.remove(&run_id)?;
        if let Some(worker) = inner.workers.get_mut(&owner) {
            if worker.current_run_id == Some(run_id) {
                worker.is_busy = false;
                worker.current_run_id = None;
            }
        }
        tracing::info!(
            event = "relay.registry.claim_cleared",
            run_id = %run_id,
            worker_id = %owner,
            "stale claim cleared"
        );
        Some(owner)
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        let inner = lock(&self.inner);
        inner
            .workers
            .get(worker_id)
            .map(|worker| snapshot(worker_id, worker))
    }

    pub fn list(&self) -> Vec<WorkerSnapshot> {
        let inner = lock(&self.inner);
        inner
            .workers
            .iter()
            .map(|(id, worker)| snapshot(id, worker))
            .collect()
    }

    /// Current claim map, for store reconciliation.
    pub fn claims(&self) -> Vec<(Uuid, String)> {
        let inner = lock(&self.inner);
        inner
            .claims
            .iter()
            .map(|(run_id, owner)| (*run_id, owner.clone()))
            .collect()
    }

    /// Workers able to accept the given task right now.
    ///
    /// The codebase filter is restrictive: a worker that registered no
    /// codebases only matches the reserved tags, never a concrete codebase.
    pub fn available_workers(
        &self,
        codebase_id: Option<&str>,
        target_agent_name: Option<&str>,
        required_capabilities: &[String],
    ) -> Vec<WorkerSnapshot> {
        let inner = lock(&self.inner);
        inner
            .workers
            .iter()
            .filter(|(_, worker)| {
                worker_matches(worker, codebase_id, target_agent_name, required_capabilities)
            })
            .map(|(id, worker)| snapshot(id, worker))
            .collect()
    }

    /// Push a `task_available` event to every matching available worker.
    /// Full mailboxes are skipped with a warning; the push never blocks.
    pub fn broadcast_task(
        &self,
        announcement: &TaskAnnouncement,
        target_agent_name: Option<&str>,
        required_capabilities: &[String],
    ) -> Vec<String> {
        let mut notified = Vec::new();
        let mut overflowed = Vec::new();

        {
            let inner = lock(&self.inner);
            for (worker_id, worker) in &inner.workers {
                if !worker_matches(
                    worker,
                    Some(announcement.codebase_id.as_str()),
                    target_agent_name,
                    required_capabilities,
                ) {
                    continue;
                }
                match worker.sender.try_send(announcement.clone()) {
                    Ok(()) => notified.push(worker_id.clone()),
                    Err(_) => overflowed.push(worker_id.clone()),
                }
            }
        }

        for worker_id in &overflowed {
            tracing::warn!(
                event = "relay.registry.mailbox_full",
                worker_id = %worker_id,
                task_id = %announcement.id,
                "mailbox full, notification dropped for worker"
            );
        }
        tracing::info!(
            event = "relay.registry.broadcast",
            task_id = %announcement.id,
            notified = notified.len(),
            "task broadcast to workers"
        );
        notified
    }

    /// Drop workers whose server-side heartbeat is older than `cutoff`.
    /// Catches dead connections that never surfaced a write failure.
    pub fn prune_stale(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = {
            let inner = lock(&self.inner);
            inner
                .workers
                .iter()
                .filter(|(_, worker)| worker.last_heartbeat < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for worker_id in &stale {
            tracing::warn!(
                event = "relay.registry.pruned",
                worker_id = %worker_id,
                "worker heartbeat stale, pruning session"
            );
            self.unregister(worker_id);
        }
        stale
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.inner).workers.len()
    }
}

fn snapshot(worker_id: &str, worker: &LiveWorker) -> WorkerSnapshot {
    let mut codebases: Vec<String> = worker.codebases.iter().cloned().collect();
    codebases.sort();
    WorkerSnapshot {
        worker_id: worker_id.to_string(),
        agent_name: worker.agent_name.clone(),
        capabilities: worker.capabilities.clone(),
        codebases,
        is_busy: worker.is_busy,
        current_run_id: worker.current_run_id,
        connected_at: worker.connected_at,
        last_heartbeat: worker.last_heartbeat,
    }
}

fn worker_matches(
    worker: &LiveWorker,
    codebase_id: Option<&str>,
    target_agent_name: Option<&str>,
    required_capabilities: &[String],
) -> bool {
    if worker.is_busy {
        return false;
    }
    if let Some(agent) = target_agent_name {
        if worker.agent_name != agent {
            return false;
        }
    }
    if let Some(codebase) = codebase_id {
        if !RESERVED_CODEBASE_TAGS.contains(&codebase) && !worker.codebases.contains(codebase) {
            return false;
        }
    }
    required_capabilities
        .iter()
        .all(|cap| worker.capabilities.contains(cap))
}

fn lock(inner: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    // Lock poisoning only happens if a holder panicked; the maps stay
    // structurally valid, so continue with the inner state.
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(codebase_id: &str) -> TaskAnnouncement {
        TaskAnnouncement {
            id: Uuid::new_v4(),
            title: "t".to_string(),
            prompt: "p".to_string(),
            model: None,
            priority: 0,
            codebase_id: codebase_id.to_string(),
            target_agent_name: None,
            required_capabilities: None,
        }
    }

    #[test]
    fn claim_is_exclusive_and_idempotent() {
        let registry = WorkerRegistry::new();
        let _rx1 = registry.register("w1", "alpha", vec![], HashSet::new());
        let _rx2 = registry.register("w2", "beta", vec![], HashSet::new());

        let run_id = Uuid::new_v4();
        assert!(registry.claim(run_id, "w1"));
        assert!(registry.claim(run_id, "w1"), "same worker re-claim is ok");
        assert!(!registry.claim(run_id, "w2"), "second worker must lose");

        assert!(!registry.release(run_id, "w2"));
        assert!(registry.release(run_id, "w1"));
        assert!(registry.claim(run_id, "w2"), "released run is claimable");
    }

    #[test]
    fn claim_requires_connected_worker() {
        let registry = WorkerRegistry::new();
        assert!(!registry.claim(Uuid::new_v4(), "ghost"));
    }

    #[test]
    fn replaced_session_cannot_unregister_its_replacement() {
        let registry = WorkerRegistry::new();
        let (_rx_old, old_token) = registry.register("w1", "alpha", vec![], HashSet::new());
        let (_rx_new, new_token) = registry.register("w1", "alpha", vec![], HashSet::new());

        assert!(!registry.unregister_session("w1", old_token));
        assert_eq!(registry.worker_count(), 1);
        assert!(registry.unregister_session("w1", new_token));
        assert_eq!(registry.worker_count(), 0);
    }

    #[test]
    fn unregister_drops_owned_claims() {
        let registry = WorkerRegistry::new();
        let _rx = registry.register("w1", "alpha", vec![], HashSet::new());
        let run_id = Uuid::new_v4();
        assert!(registry.claim(run_id, "w1"));

        registry.unregister("w1");
        assert!(registry.claims().is_empty());

        let _rx = registry.register("w2", "beta", vec![], HashSet::new());
        assert!(registry.claim(run_id, "w2"));
    }

    #[test]
    fn empty_codebase_set_only_matches_reserved_tags() {
        let registry = WorkerRegistry::new();
        let _rx = registry.register("w1", "alpha", vec![], HashSet::new());

        // Worker with no codebases must not see codebase-specific tasks.
        assert!(registry
            .available_workers(Some("proj-x"), None, &[])
            .is_empty());

        // Reserved tags match any worker.
        assert_eq!(registry.available_workers(Some("global"), None, &[]).len(), 1);
        assert_eq!(
            registry
                .available_workers(Some("__pending__"), None, &[])
                .len(),
            1
        );
    }

    #[test]
    fn codebase_affinity_matches_registered_sets() {
        let registry = WorkerRegistry::new();
        let _rx = registry.register(
            "w1",
            "alpha",
            vec![],
            HashSet::from(["proj-x".to_string()]),
        );

        assert_eq!(registry.available_workers(Some("proj-x"), None, &[]).len(), 1);
        assert!(registry
            .available_workers(Some("proj-y"), None, &[])
            .is_empty());
    }

    #[test]
    fn capability_filter_requires_superset() {
        let registry = WorkerRegistry::new();
        let _rx = registry.register(
            "w1",
            "alpha",
            vec!["coding".to_string()],
            HashSet::new(),
        );

        let need_coding = ["coding".to_string()];
        let need_both = ["coding".to_string(), "testing".to_string()];
        assert_eq!(registry.available_workers(None, None, &need_coding).len(), 1);
        assert!(registry
            .available_workers(None, None, &need_both)
            .is_empty());
    }

    #[test]
    fn agent_name_targeting_filters_workers() {
        let registry = WorkerRegistry::new();
        let _rx1 = registry.register("w1", "alpha", vec![], HashSet::new());
        let _rx2 = registry.register("w2", "beta", vec![], HashSet::new());

        let available = registry.available_workers(None, Some("alpha"), &[]);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].worker_id, "w1");
    }

    #[test]
    fn busy_workers_are_not_available() {
        let registry = WorkerRegistry::new();
        let _rx = registry.register("w1", "alpha", vec![], HashSet::new());
        assert_eq!(registry.available_workers(None, None, &[]).len(), 1);

        assert!(registry.claim(Uuid::new_v4(), "w1"));
        assert!(registry.available_workers(None, None, &[]).is_empty());
    }

    #[tokio::test]
    async fn broadcast_targets_matching_agent_only() {
        let registry = WorkerRegistry::new();
        let (mut rx1, _) = registry.register("w1", "alpha", vec![], HashSet::new());
        let (mut rx2, _) = registry.register("w2", "beta", vec![], HashSet::new());

        let mut task = announcement("global");
        task.target_agent_name = Some("alpha".to_string());
        let notified = registry.broadcast_task(&task, Some("alpha"), &[]);

        assert_eq!(notified, vec!["w1".to_string()]);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_full_mailboxes() {
        let registry = WorkerRegistry::new();
        let _rx = registry.register("w1", "alpha", vec![], HashSet::new());

        let task = announcement("global");
        for _ in 0..MAILBOX_CAPACITY {
            assert_eq!(registry.broadcast_task(&task, None, &[]).len(), 1);
        }
        // Mailbox is full; the worker is skipped rather than blocking.
        assert!(registry.broadcast_task(&task, None, &[]).is_empty());
    }

    #[test]
    fn prune_stale_unregisters_quiet_workers() {
        let registry = WorkerRegistry::new();
        let _rx = registry.register("w1", "alpha", vec![], HashSet::new());

        assert!(registry.prune_stale(Utc::now() - chrono::Duration::seconds(60)).is_empty());
        let pruned = registry.prune_stale(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(pruned, vec!["w1".to_string()]);
        assert_eq!(registry.worker_count(), 0);
    }
}
