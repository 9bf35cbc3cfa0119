//! Member endpoints: /v1/members
//!
//! Evacuate and restore run in the background; they answer `202 Accepted`
//! with an operation ID to poll under `/v1/operations/{id}`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use drover_events::{EvacuationMode, MemberStatus, SchedulerMode};
use serde::{Deserialize, Serialize};

use super::{accepted, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::membership::{HeartbeatReport, MemberSpec};
use crate::operations::OperationKind;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_members).post(add_member))
        .route("/{name}", get(get_member).delete(remove_member))
        .route("/{name}/groups", put(set_groups))
        .route("/{name}/scheduler-mode", put(set_scheduler_mode))
        .route("/{name}/heartbeat", post(heartbeat))
        .route("/{name}/evacuate", post(evacuate))
        .route("/{name}/restore", post(restore))
}

#[derive(Debug, Deserialize)]
pub struct SetGroupsRequest {
    pub groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetSchedulerModeRequest {
    pub mode: SchedulerMode,
}

#[derive(Debug, Deserialize)]
pub struct EvacuateRequest {
    /// Omitted means `auto`.
    #[serde(default)]
    pub mode: EvacuationMode,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
    pub status: MemberStatus,
    pub next_heartbeat_secs: u64,
}

async fn list_members(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let members = state
        .cluster()
        .membership()
        .list()
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::from(members)))
}

async fn add_member(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(spec): Json<MemberSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let member = state
        .cluster()
        .membership()
        .add_member(spec)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok((StatusCode::CREATED, Json(member)))
}

async fn get_member(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let member = state
        .cluster()
        .membership()
        .get_by_name(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(member))
}

async fn remove_member(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .cluster()
        .membership()
        .remove_member(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_groups(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<SetGroupsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let member = state
        .cluster()
        .membership()
        .set_groups(&name, req.groups)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(member))
}

async fn set_scheduler_mode(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<SetSchedulerModeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let member = state
        .cluster()
        .membership()
        .set_scheduler_mode(&name, req.mode)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(member))
}

async fn heartbeat(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(report): Json<HeartbeatReport>,
) -> Result<impl IntoResponse, ApiError> {
    let membership = state.cluster().membership();
    let member = membership
        .heartbeat(&name, report)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(HeartbeatResponse {
        accepted: true,
        status: member.status,
        next_heartbeat_secs: membership.settings().heartbeat_interval.as_secs().max(1),
    }))
}

async fn evacuate(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<EvacuateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Unknown members fail the request itself rather than the operation.
    state
        .cluster()
        .membership()
        .get_by_name(&name)
        .await
        .map_err(|e| ctx.error(e))?;

    let orchestrator = state.cluster().orchestrator().clone();
    let member = name.clone();
    let operation_id = state
        .cluster()
        .operations()
        .spawn(OperationKind::Evacuate, &name, move |id, cancel| async move {
            orchestrator
                .evacuate(&member, req.mode, Some(id), &cancel)
                .await
        })
        .await;
    Ok(accepted(operation_id, OperationKind::Evacuate, name))
}

async fn restore(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .cluster()
        .membership()
        .get_by_name(&name)
        .await
        .map_err(|e| ctx.error(e))?;

    let orchestrator = state.cluster().orchestrator().clone();
    let member = name.clone();
    let operation_id = state
        .cluster()
        .operations()
        .spawn(OperationKind::Restore, &name, move |id, cancel| async move {
            orchestrator.restore(&member, Some(id), &cancel).await
        })
        .await;
    Ok(accepted(operation_id, OperationKind::Restore, name))
}
