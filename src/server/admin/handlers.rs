// src/server/admin/handlers.rs

//! Request handlers for the JSON admin surface.

use super::AdminState;
use super::auth;
use crate::core::RelayError;
use crate::core::failover::{FailoverRequest, NodeRequestKind, RequestOrigin};
use crate::core::state::{ControlEvent, ShutdownMode};
use crate::core::status::TransitionReason;
use crate::core::watchdog;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// An admin error rendered as `{error, message}` with a proper status code.
pub struct AdminError {
    pub status: StatusCode,
    pub message: String,
}

impl AdminError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<RelayError> for AdminError {
    fn from(e: RelayError) -> Self {
        let status = match &e {
            RelayError::ClusterInTransaction => StatusCode::CONFLICT,
            RelayError::AdminRejected(_) => StatusCode::BAD_REQUEST,
            RelayError::ConfigInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.status.canonical_reason().unwrap_or("error"),
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

/// `POST /api/v1/auth/login` — issues a bearer token.
pub async fn login(
    State(state): State<Arc<AdminState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let config = state.runtime.config();
    if config.admin.password.is_empty() || config.admin.jwt_secret.is_empty() {
        return Err(AdminError::new(
            StatusCode::NOT_IMPLEMENTED,
            "token issuance requires admin.password and admin.jwt_secret",
        ));
    }
    if request.username != config.admin.username || request.password != config.admin.password {
        return Err(AdminError::new(
            StatusCode::UNAUTHORIZED,
            "bad username or password",
        ));
    }
    let token = auth::issue_token(
        &config.admin.jwt_secret,
        &request.username,
        config.admin.token_ttl,
    )?;
    Ok(Json(json!({
        "token": token,
        "token_type": "Bearer",
        "expires_in": config.admin.token_ttl.as_secs(),
    })))
}

/// `GET /api/v1/status`.
pub async fn status(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
    let snapshot = state.runtime.status.snapshot();
    let up = snapshot.entries.iter().filter(|e| e.selectable()).count();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "run_id": state.runtime.run_id,
        "started_at": state.runtime.started_at,
        "status_generation": snapshot.generation,
        "backends_total": snapshot.entries.len(),
        "backends_up": up,
        "primary": snapshot.primary().map(|e| e.node_id),
        "workers": state.runtime.workers.len(),
    }))
}

fn node_json(entry: &crate::core::status::BackendEntry) -> serde_json::Value {
    json!({
        "node_id": entry.node_id,
        "host": entry.host,
        "port": entry.port,
        "status": entry.status.to_string(),
        "quarantined": entry.quarantined,
        "role": entry.role.to_string(),
        "weight": entry.weight,
        "replication_lag": entry.replication_lag,
        "status_changed_at": entry.status_changed_at,
        "data_directory": entry.data_directory,
        "application_name": entry.application_name,
    })
}

/// `GET /api/v1/nodes`.
pub async fn nodes(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
    let snapshot = state.runtime.status.snapshot();
    Json(json!({
        "generation": snapshot.generation,
        "nodes": snapshot.entries.iter().map(node_json).collect::<Vec<_>>(),
    }))
}

/// `GET /api/v1/nodes/{id}`.
pub async fn node(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<usize>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let snapshot = state.runtime.status.snapshot();
    let entry = snapshot
        .entries
        .get(id)
        .ok_or_else(|| AdminError::not_found(format!("no backend node {id}")))?;
    Ok(Json(node_json(entry)))
}

/// `POST /api/v1/nodes/{id}/{action}` for attach, detach, promote, recovery.
pub async fn node_action(
    State(state): State<Arc<AdminState>>,
    Path((id, action)): Path<(usize, String)>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let snapshot = state.runtime.status.snapshot();
    if snapshot.entries.get(id).is_none() {
        return Err(AdminError::not_found(format!("no backend node {id}")));
    }

    let (kind, reason) = match action.as_str() {
        "attach" => (NodeRequestKind::Failback, TransitionReason::AdminAttach),
        "detach" => (NodeRequestKind::Detach, TransitionReason::AdminDetach),
        "promote" => (NodeRequestKind::Promote, TransitionReason::Promote),
        // Recovery re-runs the failback path after the operator's recovery
        // procedure completed.
        "recovery" => (NodeRequestKind::Failback, TransitionReason::Restore),
        other => {
            return Err(AdminError::new(
                StatusCode::NOT_FOUND,
                format!("unknown node action '{other}'"),
            ));
        }
    };

    info!("Admin request: {action} node {id}");
    state.runtime.post_request(FailoverRequest::node(
        id,
        kind,
        reason,
        RequestOrigin::Admin,
        snapshot.generation,
    ));
    Ok(Json(json!({
        "status": "accepted",
        "node_id": id,
        "action": action,
    })))
}

/// `GET /api/v1/processes`.
pub async fn processes(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
    let mut workers: Vec<_> = state
        .runtime
        .workers
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    workers.sort_by_key(|w| w.worker_id);
    Json(json!({ "processes": workers }))
}

/// `GET /api/v1/health/stats`.
pub async fn health_stats(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
    let stats = state.runtime.health.snapshot();
    let nodes: Vec<_> = stats
        .iter()
        .enumerate()
        .map(|(node_id, s)| {
            json!({
                "node_id": node_id,
                "total": s.total_count,
                "success": s.success_count,
                "fail": s.fail_count,
                "skip": s.skip_count,
                "retry": s.retry_count,
                "max_retry_count": s.max_retry_count,
                "average_duration_ms": s.average_duration_ms(),
                "max_duration_ms": s.max_duration_ms,
                "min_duration_ms": s.min_duration_ms,
                "last_health_check": s.last_health_check,
                "last_successful_health_check": s.last_successful_health_check,
                "last_failed_health_check": s.last_failed_health_check,
                "last_skipped_health_check": s.last_skipped_health_check,
            })
        })
        .collect();
    Json(json!({ "stats": nodes }))
}

/// `POST /api/v1/control/{action}` for stop, reload, logrotate.
pub async fn control(
    State(state): State<Arc<AdminState>>,
    Path(action): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    match action.as_str() {
        "stop" => {
            info!("Admin request: smart shutdown");
            state
                .runtime
                .broadcast(ControlEvent::Shutdown(ShutdownMode::Smart));
            Ok(Json(json!({ "status": "stopping" })))
        }
        "reload" => {
            state.runtime.reload_from_disk()?;
            Ok(Json(json!({ "status": "reloaded" })))
        }
        "logrotate" => {
            let destination = state.runtime.config().log_destination.clone();
            info!("Admin request: log rotation (destination: {destination})");
            Ok(Json(json!({
                "status": "ok",
                "log_destination": destination,
            })))
        }
        other => Err(AdminError::new(
            StatusCode::NOT_FOUND,
            format!("unknown control action '{other}'"),
        )),
    }
}

/// `POST /api/v1/cache/invalidate` — workers drop their pool-slot caches at
/// the next idle boundary.
pub async fn cache_invalidate(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
    info!("Admin request: invalidate pool caches");
    state.runtime.broadcast(ControlEvent::BackendStateSync);
    Json(json!({ "status": "accepted" }))
}

/// `GET /api/v1/watchdog/info`.
pub async fn watchdog_info(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let handle = state
        .watchdog
        .as_ref()
        .ok_or_else(|| AdminError::not_found("watchdog is not configured"))?;
    Ok(Json(watchdog::describe(handle)))
}

/// `GET /api/v1/watchdog/status`.
pub async fn watchdog_status(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let handle = state
        .watchdog
        .as_ref()
        .ok_or_else(|| AdminError::not_found("watchdog is not configured"))?;
    Ok(Json(json!({
        "active": handle.is_active(),
        "leader": handle.leader(),
        "is_leader": handle.is_leader(),
        "has_quorum": handle.has_quorum(),
        "epoch": handle.current_epoch(),
    })))
}

/// `POST /api/v1/watchdog/{action}` for start, stop.
pub async fn watchdog_action(
    State(state): State<Arc<AdminState>>,
    Path(action): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let handle = state
        .watchdog
        .as_ref()
        .ok_or_else(|| AdminError::not_found("watchdog is not configured"))?;
    match action.as_str() {
        "start" => {
            handle.set_active(true);
            Ok(Json(json!({ "status": "active" })))
        }
        "stop" => {
            handle.set_active(false);
            Ok(Json(json!({ "status": "inactive" })))
        }
        other => Err(AdminError::new(
            StatusCode::NOT_FOUND,
            format!("unknown watchdog action '{other}'"),
        )),
    }
}
