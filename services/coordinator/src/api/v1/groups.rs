//! Placement scopes: /v1/groups, /v1/projects and /v1/pools

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;

use super::ListResponse;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_groups).post(create_group))
        .route("/{name}", delete(delete_group))
        .route("/{name}/rename", post(rename_group))
}

pub fn project_routes() -> Router<AppState> {
    Router::new()
        .route("/projects/{name}/group", put(set_project_group))
        .route("/pools", post(create_pool))
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameGroupRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SetProjectGroupRequest {
    pub group: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    /// Shared storage reachable from every member.
    #[serde(default)]
    pub remote: bool,
}

async fn list_groups(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let groups = state
        .cluster()
        .membership()
        .list_groups()
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::from(groups)))
}

async fn create_group(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state
        .cluster()
        .membership()
        .create_group(&req.name, &req.description)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn delete_group(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .cluster()
        .membership()
        .delete_group(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rename_group(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<RenameGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state
        .cluster()
        .membership()
        .rename_group(&name, &req.name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(group))
}

async fn set_project_group(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<SetProjectGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .cluster()
        .membership()
        .set_project_group(&name, &req.group)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(project))
}

async fn create_pool(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreatePoolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state
        .cluster()
        .membership()
        .create_pool(&req.name, req.remote)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok((StatusCode::CREATED, Json(pool)))
}
