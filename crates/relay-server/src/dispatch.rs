//! Push-side dispatch: turn a queued run into `task_available` events.
//!
//! Push is the optimization; polling via `claim_next` is the correctness
//! floor. Dispatch failures are logged and dropped, never propagated into
//! the enqueue path.

use std::sync::Arc;

use relay_core::TaskRun;
use relay_queue::TaskRecord;

use crate::registry::{TaskAnnouncement, WorkerRegistry};

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Announce a queued run to every matching available worker. Returns the
    /// ids notified.
    pub fn announce_run(&self, task: &TaskRecord, run: &TaskRun) -> Vec<String> {
        let announcement = build_announcement(task, run);
        let required = run.required_capabilities.clone().unwrap_or_default();
        self.registry.broadcast_task(
            &announcement,
            run.target_agent_name.as_deref(),
            &required,
        )
    }
}

fn build_announcement(task: &TaskRecord, run: &TaskRun) -> TaskAnnouncement {
    let codebase_id = task
        .metadata
        .get("codebase_id")
        .and_then(|v| v.as_str())
        .unwrap_or("global")
        .to_string();

    TaskAnnouncement {
        id: task.id,
        title: task
            .title
            .clone()
            .unwrap_or_else(|| format!("Task {}", short_id(task.id))),
        prompt: task.prompt.clone(),
        model: task.model.clone(),
        priority: run.priority,
        codebase_id,
        target_agent_name: run.target_agent_name.clone(),
        required_capabilities: run.required_capabilities.clone(),
    }
}

pub(crate) fn short_id(id: uuid::Uuid) -> String {
    let s = id.simple().to_string();
    s[..8].to_string()
}
