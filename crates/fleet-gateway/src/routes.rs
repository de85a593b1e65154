use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use fleet_core::error::FleetError;
use fleet_core::run::RunStatus;
use fleet_core::types::{Context, Event, RunId};

use crate::middleware::Authenticated;
use crate::state::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn error_response(e: FleetError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        FleetError::RunNotFound(_)
        | FleetError::SequenceNotFound(_)
        | FleetError::VersionNotFound { .. } => StatusCode::NOT_FOUND,
        FleetError::InvalidRunState { .. } => StatusCode::CONFLICT,
        FleetError::Condition { .. }
        | FleetError::Config(_)
        | FleetError::CyclicDependency { .. }
        | FleetError::UnknownDependency { .. }
        | FleetError::DuplicateStep { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %e, "Request failed");
    }
    (status, Json(json!({ "error": e.to_string() })))
}

// GET /api/health: no auth required
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct SubmitQuery {
    #[serde(default)]
    pub wait: bool,
}

// POST /api/events?wait=false
pub async fn submit_event(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<SubmitQuery>,
    Json(event): Json<Event>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if event.event_type.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "event_type is required" })),
        ));
    }
    info!(event_id = %event.id, event_type = %event.event_type, org_id = %event.org_id, "Event received");

    if !q.wait {
        let event_id = state.fleet.submit_event(event);
        return Ok((StatusCode::ACCEPTED, Json(json!({ "event_id": event_id }))));
    }

    let outcome = state.fleet.handle_event(event).await.map_err(error_response)?;
    let body = serde_json::to_value(&outcome)
        .map_err(|e| error_response(FleetError::Json(e)))?;
    Ok((StatusCode::OK, Json(body)))
}

#[derive(Deserialize)]
pub struct RunsQuery {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/runs?status=awaiting_approval&limit=50
pub async fn list_runs(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<RunsQuery>,
) -> ApiResult {
    let runs = state
        .fleet
        .list_runs(q.status, q.limit)
        .map_err(error_response)?;
    let summaries: Vec<Value> = runs
        .iter()
        .map(|r| {
            json!({
                "run_id": r.run_id,
                "sequence_key": r.sequence_key,
                "version": r.version,
                "status": r.status,
                "updated_at": r.updated_at,
            })
        })
        .collect();
    Ok(Json(json!({ "runs": summaries })))
}

// GET /api/runs/{id}
pub async fn get_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let run = state
        .fleet
        .run(&RunId::from_string(&id))
        .map_err(error_response)?;
    Ok(Json(json!(run)))
}

// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let run = state
        .fleet
        .cancel(&RunId::from_string(&id))
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "run_id": run.run_id, "status": run.status })))
}

// GET /api/approvals
pub async fn list_approvals(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
) -> Json<Value> {
    let pending = state.fleet.pending_approvals().await;
    Json(json!({ "approvals": pending }))
}

// POST /api/runs/{id}/steps/{step}/approve
pub async fn approve_step(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, step)): Path<(String, String)>,
) -> ApiResult {
    let run = state
        .fleet
        .approve(&RunId::from_string(&id), &step)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "run_id": run.run_id, "status": run.status })))
}

// POST /api/runs/{id}/steps/{step}/reject
pub async fn reject_step(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, step)): Path<(String, String)>,
) -> ApiResult {
    let run = state
        .fleet
        .reject(&RunId::from_string(&id), &step)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "run_id": run.run_id, "status": run.status })))
}

/// Result posted back by a remote skill. `error` wins when both are set.
#[derive(Deserialize)]
pub struct CompletionBody {
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
}

// POST /api/runs/{id}/steps/{step}/complete: skill callback
pub async fn complete_step(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, step)): Path<(String, String)>,
    Json(body): Json<CompletionBody>,
) -> ApiResult {
    let result = match body.error {
        Some(message) => Err(message),
        None => Ok(Context::from_value(body.output)),
    };
    if state
        .fleet
        .complete_step(&RunId::from_string(&id), &step, result)
    {
        Ok(Json(json!({ "delivered": true })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("step {} of run {} is not waiting", step, id) })),
        ))
    }
}
