//! Webhook delivery.
//!
//! The payload carries the same `run_id` on every retry; consumers dedupe
//! on it. Anything other than a 2xx response counts as a failed send.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use relay_queue::NotificationContext;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: &'static str,
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub status: &'static str,
    pub result: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    pub fn for_run(ctx: &NotificationContext) -> Self {
        Self {
            event: "task_completed",
            run_id: ctx.run_id,
            task_id: ctx.task_id,
            status: crate::status_label(ctx.status),
            result: ctx.result_summary.clone(),
            error: ctx.last_error.clone(),
            timestamp: Utc::now(),
        }
    }
}

pub async fn post_webhook(
    http: &reqwest::Client,
    url: &str,
    payload: &WebhookPayload,
    timeout: Duration,
) -> anyhow::Result<()> {
    let resp = http
        .post(url)
        .timeout(timeout)
        .json(payload)
        .send()
        .await
        .with_context(|| format!("POST webhook {url}"))?;

    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("webhook returned {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::TaskRunStatus;

    #[test]
    fn payload_serializes_expected_fields() {
        let ctx = NotificationContext {
            run_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            status: TaskRunStatus::Completed,
            notify_email: None,
            notify_webhook_url: Some("https://example/hook".to_string()),
            email_status: None,
            webhook_status: None,
            result_summary: Some("done".to_string()),
            result_full: None,
            last_error: None,
            runtime_seconds: Some(3),
            title: Some("Demo".to_string()),
        };

        let payload = WebhookPayload::for_run(&ctx);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event"], "task_completed");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"], "done");
        assert!(json["timestamp"].is_string());
    }
}
