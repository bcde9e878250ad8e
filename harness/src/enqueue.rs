use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use relay_queue::{EnqueueRequest, TaskQueue};

use crate::config::HarnessConfig;

/// Create a task and enqueue a run for it.
///
/// This exists purely to make manual testing ergonomic:
/// - `server` + `worker` can run in separate terminals
/// - you can enqueue tasks without opening psql
pub async fn run(
    cfg: &HarnessConfig,
    prompt: String,
    priority: i32,
    target_agent_name: Option<String>,
) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect database")?;
    let queue = TaskQueue::new(pool);

    let external_id = Uuid::new_v4().to_string();
    let task_id = queue
        .create_task_for_external(&external_id, "Harness task", &prompt, None, None)
        .await
        .context("create task")?;

    let run = queue
        .enqueue(EnqueueRequest {
            task_id,
            priority,
            max_attempts: 3,
            target_agent_name,
            skip_limit_check: true,
            ..Default::default()
        })
        .await
        .context("enqueue run")?;

    println!("enqueued task_id={task_id} run_id={}", run.id);
    Ok(())
}
