//! JSON-RPC client for the agent runtime.
//!
//! The runtime exposes a `tools/call` surface; workers use exactly two
//! tools: `get_task` and `continue_task`. Tool results arrive as content
//! blocks whose text is usually JSON; when it is not, the raw text becomes
//! the result summary.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use relay_core::runtime::{AgentOutcome, AgentRuntime, RuntimeError, TaskDetails};

#[derive(Debug, Clone)]
pub struct HttpAgentRuntime {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAgentRuntime {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RuntimeError> {
        let url = self.url("/mcp/v1/rpc").map_err(RuntimeError::Other)?;
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": { "name": tool, "arguments": arguments },
            "id": Uuid::new_v4().to_string(),
        });

        let mut req = self.http.post(url).json(&body);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.map_err(|err| {
            if err.is_timeout() {
                RuntimeError::Timeout
            } else {
                RuntimeError::Other(anyhow::Error::from(err).context(format!("POST tools/call {tool}")))
            }
        })?;

        let resp = resp
            .error_for_status()
            .with_context(|| format!("{tool} status"))
            .map_err(RuntimeError::Other)?;

        let data: Value = resp
            .json()
            .await
            .with_context(|| format!("decode {tool} response"))
            .map_err(RuntimeError::Other)?;

        if let Some(err) = data.get("error") {
            return Err(RuntimeError::Other(anyhow::anyhow!(
                "{tool} rpc error: {err}"
            )));
        }

        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        let base = Url::parse(&self.base_url).context("parse runtime base URL")?;
        base.join(path).context("join runtime URL")
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn get_task(&self, task_id: Uuid) -> anyhow::Result<Option<TaskDetails>> {
        let result = match self
            .call_tool(
                "get_task",
                serde_json::json!({ "task_id": task_id }),
                Some(Duration::from_secs(30)),
            )
            .await
        {
            Ok(result) => result,
            Err(RuntimeError::Timeout) => anyhow::bail!("get_task timed out"),
            Err(RuntimeError::Other(err)) => return Err(err),
        };

        let Some(payload) = tool_result_json(&result) else {
            return Ok(None);
        };

        let prompt = payload
            .get("prompt")
            .or_else(|| payload.get("description"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        Ok(Some(TaskDetails {
            task_id,
            title: payload
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string),
            prompt,
            model: payload
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: payload
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
        }))
    }

    async fn continue_task(
        &self,
        task_id: Uuid,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AgentOutcome, RuntimeError> {
        let result = self
            .call_tool(
                "continue_task",
                serde_json::json!({ "task_id": task_id, "input": prompt }),
                Some(timeout),
            )
            .await?;

        Ok(outcome_from_tool_result(&result))
    }
}

/// Pull the JSON payload out of a tool result's text content block, when
/// there is one and it parses.
fn tool_result_json(result: &Value) -> Option<Value> {
    let text = tool_result_text(result)?;
    serde_json::from_str(&text).ok()
}

fn tool_result_text(result: &Value) -> Option<String> {
    let content = result.get("content")?.as_array()?;
    for block in content {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn outcome_from_tool_result(result: &Value) -> AgentOutcome {
    if let Some(text) = tool_result_text(result) {
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            let summary = parsed
                .get("summary")
                .or_else(|| parsed.get("result"))
                .and_then(Value::as_str)
                .unwrap_or("Task completed")
                .to_string();
            return AgentOutcome {
                summary,
                full: parsed,
            };
        }
        return AgentOutcome {
            summary: text.clone(),
            full: serde_json::json!({ "raw": text }),
        };
    }

    AgentOutcome {
        summary: "Task completed".to_string(),
        full: result.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_prefers_summary_from_json_text() {
        let result = serde_json::json!({
            "content": [{ "type": "text", "text": "{\"summary\":\"did it\",\"files\":3}" }]
        });
        let outcome = outcome_from_tool_result(&result);
        assert_eq!(outcome.summary, "did it");
        assert_eq!(outcome.full["files"], 3);
    }

    #[test]
    fn outcome_wraps_plain_text() {
        let result = serde_json::json!({
            "content": [{ "type": "text", "text": "plain answer" }]
        });
        let outcome = outcome_from_tool_result(&result);
        assert_eq!(outcome.summary, "plain answer");
        assert_eq!(outcome.full["raw"], "plain answer");
    }

    #[test]
    fn outcome_falls_back_to_raw_result() {
        let result = serde_json::json!({ "ok": true });
        let outcome = outcome_from_tool_result(&result);
        assert_eq!(outcome.summary, "Task completed");
        assert_eq!(outcome.full["ok"], true);
    }
}
