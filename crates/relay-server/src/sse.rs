//! Worker-facing SSE stream.
//!
//! Workers open `GET /v1/worker/tasks/stream` identifying themselves by
//! agent name; the server registers the session, emits a `connected` event,
//! then forwards mailbox notifications as `task_available` frames. Quiet
//! periods produce `heartbeat` frames every `heartbeat_interval` and
//! refresh the server-side heartbeat. Stream teardown (client disconnect
//! or replacement by a reconnect) unregisters the session; any lease the
//! worker held stays in the store for the reaper.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::{TaskAnnouncement, WorkerRegistry};
use crate::routes::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub agent_name: Option<String>,
    pub worker_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConnectedPayload<'a> {
    worker_id: &'a str,
    agent_name: &'a str,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HeartbeatPayload<'a> {
    timestamp: chrono::DateTime<Utc>,
    worker_id: &'a str,
}

/// Unregisters the session when the stream is dropped, whatever the reason
/// (peer closed, write failure, server shutdown).
struct SessionGuard {
    registry: Arc<WorkerRegistry>,
    worker_id: String,
    session_token: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry
            .unregister_session(&self.worker_id, self.session_token);
    }
}

struct StreamState {
    rx: mpsc::Receiver<TaskAnnouncement>,
    registry: Arc<WorkerRegistry>,
    worker_id: String,
    heartbeat_interval: Duration,
    _guard: SessionGuard,
}

pub async fn worker_task_stream(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.auth.verify(&headers).map_err(ApiError::from_auth)?;

    let agent_name = params
        .agent_name
        .or_else(|| header_value(&headers, "x-agent-name"))
        .ok_or_else(|| {
            ApiError::bad_request("agent_name is required (query param or X-Agent-Name header)")
        })?;

    let worker_id = params
        .worker_id
        .or_else(|| header_value(&headers, "x-worker-id"))
        .unwrap_or_else(generate_worker_id);

    let capabilities = parse_csv(header_value(&headers, "x-capabilities").as_deref());
    let codebases: HashSet<String> = parse_csv(header_value(&headers, "x-codebases").as_deref())
        .into_iter()
        .collect();

    let registry = state.registry.clone();
    let (rx, session_token) = registry.register(&worker_id, &agent_name, capabilities, codebases);

    let connected = sse_event(
        "connected",
        &ConnectedPayload {
            worker_id: &worker_id,
            agent_name: &agent_name,
            timestamp: Utc::now(),
        },
    );

    let stream_state = StreamState {
        rx,
        registry: registry.clone(),
        worker_id: worker_id.clone(),
        heartbeat_interval: state.sse_heartbeat,
        _guard: SessionGuard {
            registry,
            worker_id,
            session_token,
        },
    };

    let events = stream::unfold(stream_state, |mut st| async move {
        match tokio::time::timeout(st.heartbeat_interval, st.rx.recv()).await {
            Ok(Some(announcement)) => {
                let event = sse_event("task_available", &announcement);
                Some((Ok::<_, Infallible>(event), st))
            }
            // Sender dropped: the session was replaced or unregistered.
            Ok(None) => None,
            Err(_) => {
                st.registry.update_heartbeat(&st.worker_id);
                let event = sse_event(
                    "heartbeat",
                    &HeartbeatPayload {
                        timestamp: Utc::now(),
                        worker_id: &st.worker_id,
                    },
                );
                Some((Ok(event), st))
            }
        }
    });

    let stream = stream::once(async move { Ok::<_, Infallible>(connected) }).chain(events);
    Ok(Sse::new(stream))
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(name).data(data)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_csv(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn generate_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parsing_trims_and_drops_empties() {
        assert_eq!(
            parse_csv(Some(" coding , testing ,, ")),
            vec!["coding".to_string(), "testing".to_string()]
        );
        assert!(parse_csv(None).is_empty());
    }

    #[test]
    fn generated_worker_ids_are_short_hex() {
        let id = generate_worker_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
