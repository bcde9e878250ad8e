//! Worker control-plane HTTP handlers.
//!
//! `claim` and `release` are the single place where worker-side commits hit
//! the store and the registry, atomically-by-ordering: SQL claim first,
//! then registry claim (rolling the SQL claim back if the mirror refuses);
//! on release, store completion first, then registry release.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use relay_core::{TaskRunStatus, WorkerIdentity};

use crate::auth::AuthError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WorkerParams {
    pub worker_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskClaimRequest {
    pub task_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TaskReleaseRequest {
    pub task_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CodebaseUpdateRequest {
    pub codebases: Vec<String>,
}

/// Claim a task after a `task_available` push. 200 with the run id on
/// success, 409 when another worker won or the run is no longer eligible.
pub async fn claim_task(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WorkerParams>,
    headers: HeaderMap,
    Json(req): Json<TaskClaimRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.auth.verify(&headers).map_err(ApiError::from_auth)?;
    let worker_id = resolve_worker_id(&params, &headers)?;

    let Some(snapshot) = state.registry.get(&worker_id) else {
        return Err(ApiError::not_found("worker not connected"));
    };
    let identity = WorkerIdentity {
        worker_id: worker_id.clone(),
        agent_name: snapshot.agent_name,
        capabilities: snapshot.capabilities,
    };

    let run = state
        .queue
        .store()
        .claim_task_run(req.task_id, &identity, state.lease_duration_secs)
        .await
        .map_err(ApiError::internal)?;

    let Some(run) = run else {
        return Err(ApiError::conflict("task already claimed or not eligible"));
    };

    if !state.registry.claim(run.id, &worker_id) {
        // The mirror refused (another claim raced in, or the session went
        // away between the SQL claim and here); undo the SQL claim.
        let rolled_back = state
            .queue
            .store()
            .unclaim_task_run(run.id, &worker_id)
            .await
            .map_err(ApiError::internal)?;
        if !rolled_back {
            tracing::error!(
                event = "relay.routes.claim.rollback_lost",
                run_id = %run.id,
                worker_id = %worker_id,
                "sql claim rollback found no row; reaper will recover"
            );
        }
        return Err(ApiError::conflict("task already claimed or not eligible"));
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "task_id": req.task_id,
        "run_id": run.id,
        "worker_id": worker_id,
    })))
}

/// Release a claimed task with its outcome. Store completion settles the
/// run (and arms notifications) before the registry claim is dropped.
pub async fn release_task(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WorkerParams>,
    headers: HeaderMap,
    Json(req): Json<TaskReleaseRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.auth.verify(&headers).map_err(ApiError::from_auth)?;
    let worker_id = resolve_worker_id(&params, &headers)?;

    let status = match TaskRunStatus::parse(&req.status) {
        Some(status) if status.is_terminal() => status,
        _ => {
            return Err(ApiError::bad_request(
                "status must be completed, failed, or cancelled",
            ))
        }
    };

    let run = state
        .queue
        .get_run_by_task(req.task_id)
        .await
        .map_err(ApiError::internal)?;
    let Some(run) = run else {
        return Err(ApiError::not_found("no run for task"));
    };
    if run.lease_owner.as_deref() != Some(worker_id.as_str()) {
        return Err(ApiError::not_found("task not claimed by this worker"));
    }

    let completed = state
        .queue
        .store()
        .complete_task_run(
            run.id,
            &worker_id,
            status,
            req.result.as_deref(),
            None,
            req.error.as_deref(),
        )
        .await
        .map_err(ApiError::internal)?;
    if !completed {
        return Err(ApiError::conflict("lease no longer held"));
    }

    state.registry.release(run.id, &worker_id);

    // Notification delivery happens off the request path; the courier's
    // claim protocol makes a racing retry tick harmless.
    let courier = state.courier.clone();
    let run_id = run.id;
    tokio::spawn(async move {
        if let Err(err) = courier.deliver_for_run(run_id).await {
            tracing::warn!(
                event = "relay.routes.release.notify_error",
                run_id = %run_id,
                error = %err,
                "notification delivery failed after release"
            );
        }
    });

    Ok(Json(serde_json::json!({
        "success": true,
        "task_id": req.task_id,
        "run_id": run.id,
        "worker_id": worker_id,
        "status": status.as_str(),
    })))
}

pub async fn update_codebases(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WorkerParams>,
    headers: HeaderMap,
    Json(req): Json<CodebaseUpdateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.auth.verify(&headers).map_err(ApiError::from_auth)?;
    let worker_id = resolve_worker_id(&params, &headers)?;

    let codebases: HashSet<String> = req.codebases.iter().cloned().collect();
    if !state.registry.update_codebases(&worker_id, codebases) {
        return Err(ApiError::not_found("worker not connected"));
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "worker_id": worker_id,
        "codebases": req.codebases,
    })))
}

pub async fn list_connected(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    state.auth.verify(&headers).map_err(ApiError::from_auth)?;

    let workers = state.registry.list();
    Ok(Json(serde_json::json!({
        "workers": workers,
        "count": workers.len(),
        "timestamp": Utc::now(),
    })))
}

pub async fn get_connected(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    state.auth.verify(&headers).map_err(ApiError::from_auth)?;

    match state.registry.get(&worker_id) {
        Some(worker) => Ok(Json(serde_json::to_value(worker).map_err(ApiError::internal)?)),
        None => Err(ApiError::not_found("worker not connected")),
    }
}

fn resolve_worker_id(params: &WorkerParams, headers: &HeaderMap) -> ApiResult<String> {
    params
        .worker_id
        .clone()
        .or_else(|| {
            headers
                .get("x-worker-id")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .ok_or_else(|| {
            ApiError::bad_request("worker_id is required (query param or X-Worker-ID header)")
        })
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    pub fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    pub fn unauthorized(message: &'static str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message,
        }
    }

    pub fn forbidden(message: &'static str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message,
        }
    }

    pub fn not_found(message: &'static str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    pub fn conflict(message: &'static str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message,
        }
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(
            event = "relay.routes.internal_error",
            error = %err,
            "internal error"
        );
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error",
        }
    }

    pub fn from_auth(err: AuthError) -> Self {
        match err {
            AuthError::MissingBearer => Self::unauthorized("missing bearer token"),
            AuthError::InvalidToken => Self::forbidden("invalid token"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
