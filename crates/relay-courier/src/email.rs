//! Completion email construction and transport.
//!
//! The transport is a trait so tests and the harness can observe sends
//! without a network; the production implementation posts to a
//! SendGrid-compatible HTTP API.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use relay_core::TaskRunStatus;
use relay_queue::NotificationContext;

const RESULT_DISPLAY_MAX: usize = 3000;
const ERROR_DISPLAY_MAX: usize = 1000;

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Whether the transport has the credentials it needs. Unconfigured
    /// transports fail sends (and the courier schedules retries) rather
    /// than silently dropping.
    fn is_configured(&self) -> bool;

    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// SendGrid-style mail API client.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    from_email: String,
}

impl HttpMailer {
    pub fn new(api_url: String, api_key: String, from_email: String, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_url,
            api_key,
            from_email,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.from_email.is_empty()
    }

    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "personalizations": [{ "to": [{ "email": message.to }] }],
            "from": { "email": self.from_email },
            "subject": message.subject,
            "content": [{ "type": "text/html", "value": message.html_body }],
        });

        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("POST mail api")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("mail api returned {status}");
        }
        Ok(())
    }
}

/// Build the completion/failure email for a settled run.
pub fn build_completion_email(to: &str, ctx: &NotificationContext) -> EmailMessage {
    let title = ctx.title.as_deref().unwrap_or("Task");
    let (verb, color) = match ctx.status {
        TaskRunStatus::Completed => ("completed", "#22c55e"),
        TaskRunStatus::Cancelled => ("was cancelled", "#6b7280"),
        _ => ("failed", "#ef4444"),
    };
    let subject = format!("{title} {verb}");

    let mut rows = String::new();
    rows.push_str(&detail_row("Status", &html_escape(crate::status_label(ctx.status))));
    rows.push_str(&detail_row("Runtime", &format_runtime(ctx.runtime_seconds)));

    if ctx.status == TaskRunStatus::Completed {
        let result = extract_result_text(ctx.result_summary.as_deref(), ctx.result_full.as_ref());
        if !result.is_empty() {
            let mut shown = html_escape(&result).replace('\n', "<br>");
            if shown.len() > RESULT_DISPLAY_MAX {
                shown.truncate(floor_char_boundary(&shown, RESULT_DISPLAY_MAX));
                shown.push_str("...");
            }
            rows.push_str(&detail_row("Output", &shown));
        }
    }

    if let Some(error) = ctx.last_error.as_deref() {
        if ctx.status != TaskRunStatus::Completed {
            let mut shown = html_escape(error);
            if shown.len() > ERROR_DISPLAY_MAX {
                shown.truncate(floor_char_boundary(&shown, ERROR_DISPLAY_MAX));
                shown.push_str("...");
            }
            rows.push_str(&detail_row("Error", &format!("<pre style=\"margin:0;white-space:pre-wrap\">{shown}</pre>")));
        }
    }

    let html_body = format!(
        r#"<div style="font-family:sans-serif;max-width:600px">
  <h2 style="color:{color}">{title_escaped} {verb}</h2>
  <table style="width:100%;border-collapse:collapse">{rows}</table>
  <p style="color:#6b7280;font-size:12px">Run {run_id} / task {task_id}</p>
</div>"#,
        title_escaped = html_escape(title),
        run_id = ctx.run_id,
        task_id = ctx.task_id,
    );

    EmailMessage {
        to: to.to_string(),
        subject,
        html_body,
    }
}

fn detail_row(label: &str, value: &str) -> String {
    format!(
        r#"<tr><td style="padding:8px;border-bottom:1px solid #e5e7eb;font-weight:600;width:120px;vertical-align:top">{label}</td><td style="padding:8px;border-bottom:1px solid #e5e7eb">{value}</td></tr>"#
    )
}

/// `runtime_seconds` rendered as `XmYs` (or `Ns` under a minute).
pub fn format_runtime(seconds: Option<i64>) -> String {
    let Some(seconds) = seconds else {
        return "n/a".to_string();
    };
    if seconds < 0 {
        return "n/a".to_string();
    }
    let minutes = seconds / 60;
    let rest = seconds % 60;
    if minutes > 0 {
        format!("{minutes}m {rest}s")
    } else {
        format!("{seconds}s")
    }
}

/// Reduce a result to display text. Agent runtimes stream NDJSON; when the
/// summary looks like that, pull out the text parts instead of showing raw
/// JSON lines. Falls back to the summary, then to well-known keys of the
/// full result object.
pub fn extract_result_text(summary: Option<&str>, full: Option<&Value>) -> String {
    if let Some(summary) = summary {
        let trimmed = summary.trim();
        if !trimmed.is_empty() {
            if let Some(text) = ndjson_text(trimmed) {
                return text;
            }
            return trimmed.to_string();
        }
    }

    if let Some(Value::Object(map)) = full {
        for key in ["summary", "result", "output", "message", "text"] {
            if let Some(Value::String(s)) = map.get(key) {
                if !s.trim().is_empty() {
                    return s.trim().to_string();
                }
            }
        }
    }

    String::new()
}

fn ndjson_text(raw: &str) -> Option<String> {
    let mut texts = Vec::new();
    let mut saw_json = false;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        saw_json = true;
        let Value::Object(map) = value else {
            continue;
        };

        if map.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = map
                .get("part")
                .and_then(|p| p.get("text"))
                .and_then(Value::as_str)
            {
                texts.push(text.to_string());
                continue;
            }
        }
        for key in ["text", "result", "output", "message"] {
            if let Some(Value::String(s)) = map.get(key) {
                texts.push(s.clone());
                break;
            }
        }
    }

    if saw_json && !texts.is_empty() {
        Some(texts.join(" "))
    } else {
        None
    }
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_formats_minutes_and_seconds() {
        assert_eq!(format_runtime(Some(90)), "1m 30s");
        assert_eq!(format_runtime(Some(45)), "45s");
        assert_eq!(format_runtime(None), "n/a");
    }

    #[test]
    fn ndjson_summary_is_reduced_to_text() {
        let raw = "{\"type\":\"text\",\"part\":{\"text\":\"hello\"}}\n{\"type\":\"text\",\"part\":{\"text\":\"world\"}}";
        assert_eq!(extract_result_text(Some(raw), None), "hello world");
    }

    #[test]
    fn plain_summary_passes_through() {
        assert_eq!(extract_result_text(Some("all done"), None), "all done");
    }

    #[test]
    fn falls_back_to_full_result_keys() {
        let full = serde_json::json!({"summary": "from full"});
        assert_eq!(extract_result_text(None, Some(&full)), "from full");
        assert_eq!(extract_result_text(Some("  "), Some(&full)), "from full");
    }

    #[test]
    fn escapes_html_in_bodies() {
        assert_eq!(html_escape("<b>&</b>"), "&lt;b&gt;&amp;&lt;/b&gt;");
    }
}
