//! Front Router (spec.md §4.1): project id / API key admission shared by
//! the websocket upgrade and the HTTP management endpoints, plus the
//! `/health`, `/status`, and `/usage` handlers themselves.

use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use roombus_credentials::Validation;
use roombus_protocol::is_valid_project_id;

use crate::error::Error;
use crate::state::AppState;

/// Validate `projectId` shape and, unless the project is in the bypass
/// set, the presented API key. Shared by the websocket upgrade handler and
/// any future HTTP-only project-scoped route.
pub async fn authorize_project(state: &AppState, project_id: &str, api_key: Option<&str>) -> Result<(), Error> {
    if project_id.is_empty() {
        return Err(Error::MissingProjectId);
    }
    if !is_valid_project_id(project_id) {
        return Err(Error::MalformedProjectId(project_id.to_string()));
    }
    if state.config.bypasses_key_check(project_id) {
        return Ok(());
    }

    let Some(key) = api_key else {
        return Err(Error::InvalidApiKey(project_id.to_string()));
    };
    match state.api_keys.validate(project_id, key).await {
        Validation::Valid => Ok(()),
        Validation::Invalid => Err(Error::InvalidApiKey(project_id.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct ProjectQuery {
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
}

/// `GET /health` (spec.md §6): worker-level liveness with no `projectId`,
/// Room liveness when one is given.
pub async fn health_handler(State(state): State<AppState>, Query(query): Query<ProjectQuery>) -> impl IntoResponse {
    let Some(project_id) = query.project_id else {
        return Json(json!({ "status": "healthy", "timestamp": now_ms() })).into_response();
    };

    match state.rooms.get(&project_id) {
        Some(room) => match room.status().await {
            Some(_) => Json(json!({ "status": "healthy", "projectId": project_id, "timestamp": now_ms() })).into_response(),
            None => Json(json!({ "status": "unhealthy", "projectId": project_id, "timestamp": now_ms() })).into_response(),
        },
        None => Json(json!({ "status": "healthy", "projectId": project_id, "idle": true, "timestamp": now_ms() })).into_response(),
    }
}

/// `GET /status?projectId=P`: a snapshot of the Room's connection table.
pub async fn status_handler(State(state): State<AppState>, Query(query): Query<ProjectQuery>) -> impl IntoResponse {
    let Some(project_id) = query.project_id else {
        return Err(Error::MissingProjectId);
    };
    if !is_valid_project_id(&project_id) {
        return Err(Error::MalformedProjectId(project_id));
    }

    let status = match state.rooms.get(&project_id) {
        Some(room) => room.status().await,
        None => None,
    };

    Ok(match status {
        Some(status) => Json(json!({
            "projectId": status.project_id,
            "runtimeConnected": status.runtime_connected,
            "agentCount": status.agent_count,
            "prodCount": status.prod_count,
            "adminCount": status.admin_count,
            "pendingCount": status.pending_count,
        })),
        None => Json(json!({
            "projectId": project_id,
            "runtimeConnected": false,
            "agentCount": 0,
            "prodCount": 0,
            "adminCount": 0,
            "pendingCount": 0,
        })),
    })
}

/// `GET /usage?projectId=P` (spec.md §4.8).
pub async fn usage_handler(State(state): State<AppState>, Query(query): Query<ProjectQuery>) -> impl IntoResponse {
    let Some(project_id) = query.project_id else {
        return Err(Error::MissingProjectId);
    };
    if !is_valid_project_id(&project_id) {
        return Err(Error::MalformedProjectId(project_id));
    }

    match state.usage_store.report(&project_id).await {
        Ok(report) => Ok(Json(json!({
            "projectId": report.project_id,
            "totalRequests": report.total_requests,
            "dailyRequests": report.daily_requests.iter().map(|d| json!({
                "date": d.date,
                "count": d.count,
            })).collect::<Vec<_>>(),
        }))),
        Err(err) => {
            tracing::warn!(project_id = %project_id, error = %err, "usage report failed");
            Ok(Json(json!({
                "projectId": project_id,
                "totalRequests": 0,
                "dailyRequests": Vec::<serde_json::Value>::new(),
            })))
        },
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
