//! Agent-to-agent protocol contracts.
//!
//! The framing layer (JSON-RPC over HTTP/SSE) is owned elsewhere; this
//! module pins down exactly what the executor consumes from it
//! ([`RequestContext`]) and what it produces ([`A2aEvent`] through an
//! [`EventSink`]). Message parts are a tagged variant, not duck-typed
//! objects: only text parts contribute to the internal prompt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One part of an inbound or outbound protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Part {
    Text {
        text: String,
    },
    File {
        file: Value,
    },
    Data {
        data: Value,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aMessage {
    #[serde(default)]
    pub role: Option<String>,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// What the framing layer hands the executor per request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// External task id, chosen by the caller. Not assumed to be a UUID.
    pub task_id: String,
    pub message: A2aMessage,
    pub metadata: Option<Value>,
}

/// Protocol task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum A2aState {
    #[serde(rename = "submitted")]
    Submitted,
    #[serde(rename = "working")]
    Working,
    #[serde(rename = "input-required")]
    InputRequired,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl A2aState {
    pub fn as_str(self) -> &'static str {
        match self {
            A2aState::Submitted => "submitted",
            A2aState::Working => "working",
            A2aState::InputRequired => "input-required",
            A2aState::Completed => "completed",
            A2aState::Failed => "failed",
            A2aState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aStatus {
    pub state: A2aState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aArtifact {
    #[serde(rename = "artifactId")]
    pub artifact_id: String,
    pub name: String,
    pub parts: Vec<Part>,
}

/// Event pushed back to the protocol caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum A2aEvent {
    Status {
        #[serde(rename = "taskId")]
        task_id: String,
        status: A2aStatus,
        #[serde(rename = "final")]
        final_event: bool,
    },
    Artifact {
        #[serde(rename = "taskId")]
        task_id: String,
        artifact: A2aArtifact,
        #[serde(rename = "final")]
        final_event: bool,
    },
}

impl A2aEvent {
    pub fn status(task_id: &str, state: A2aState, message: impl Into<String>) -> Self {
        A2aEvent::Status {
            task_id: task_id.to_string(),
            status: A2aStatus {
                state,
                message: Some(message.into()),
            },
            final_event: false,
        }
    }

    pub fn final_status(task_id: &str, state: A2aState, message: impl Into<String>) -> Self {
        A2aEvent::Status {
            task_id: task_id.to_string(),
            status: A2aStatus {
                state,
                message: Some(message.into()),
            },
            final_event: true,
        }
    }
}

/// Sink for events flowing back to the protocol caller. The framing layer
/// injects the concrete implementation; there is exactly one shape of queue.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn put(&self, event: A2aEvent) -> crate::Result<()>;
}

/// Concatenate the text parts of a message, in order, newline-joined.
/// File and data parts never contribute to the prompt.
pub fn extract_prompt(message: &A2aMessage) -> String {
    let mut texts = Vec::new();
    for part in &message.parts {
        if let Part::Text { text } = part {
            texts.push(text.as_str());
        }
    }
    texts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_joins_text_parts_in_order() {
        let message = A2aMessage {
            role: Some("user".to_string()),
            parts: vec![
                Part::Text {
                    text: "hello".to_string(),
                },
                Part::Data {
                    data: serde_json::json!({"k": 1}),
                    mime_type: Some("application/json".to_string()),
                },
                Part::Text {
                    text: "world".to_string(),
                },
            ],
            metadata: None,
        };
        assert_eq!(extract_prompt(&message), "hello\nworld");
    }

    #[test]
    fn prompt_is_empty_without_text_parts() {
        let message = A2aMessage {
            role: None,
            parts: vec![Part::File {
                file: serde_json::json!({"uri": "s3://bucket/key"}),
            }],
            metadata: None,
        };
        assert_eq!(extract_prompt(&message), "");
    }

    #[test]
    fn parts_deserialize_by_tag() {
        let raw = r#"[{"type":"text","text":"hi"},{"type":"data","data":{"a":1},"mimeType":"application/json"}]"#;
        let parts: Vec<Part> = serde_json::from_str(raw).unwrap();
        assert!(matches!(parts[0], Part::Text { .. }));
        assert!(matches!(parts[1], Part::Data { .. }));
    }

    #[test]
    fn status_event_serializes_to_wire_shape() {
        let event = A2aEvent::final_status("task-1", A2aState::Completed, "done");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["taskId"], "task-1");
        assert_eq!(json["status"]["state"], "completed");
        assert_eq!(json["final"], true);
    }
}
