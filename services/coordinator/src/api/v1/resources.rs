//! Placed resources: /v1/resources

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use drover_events::PowerState;
use drover_id::ResourceId;
use serde::Deserialize;

use super::{accepted, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::operations::OperationKind;
use crate::placement::{MoveRequest, Placer};
use crate::state::AppState;
use crate::store::TargetScope;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_resources))
        .route("/{id}", get(get_resource).delete(release_resource))
        .route("/{id}/state", put(set_power_state))
        .route("/{id}/move", post(move_resource))
}

#[derive(Debug, Deserialize)]
pub struct ListResourcesQuery {
    /// Only resources hosted on this member.
    pub member: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetPowerStateRequest {
    pub state: PowerState,
}

#[derive(Debug, Deserialize)]
pub struct MoveResourceRequest {
    /// Member name or `@group`; the placement scope when absent.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub live: bool,
}

fn parse_id(ctx: &RequestContext, id: &str) -> Result<ResourceId, ApiError> {
    id.parse().map_err(|_| {
        ApiError::bad_request("invalid_resource_id", format!("invalid resource ID: {id}"))
            .with_request_id(ctx.request_id.clone())
    })
}

async fn list_resources(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListResourcesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let member = match &query.member {
        Some(name) => Some(
            state
                .cluster()
                .membership()
                .get_by_name(name)
                .await
                .map_err(|e| ctx.error(e))?
                .id,
        ),
        None => None,
    };
    let resources = state
        .cluster()
        .placement()
        .list_resources(member.as_ref())
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::from(resources)))
}

async fn get_resource(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&ctx, &id)?;
    let resource = state
        .cluster()
        .placement()
        .get_resource(&id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(resource))
}

async fn release_resource(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&ctx, &id)?;
    state
        .cluster()
        .placement()
        .release(&id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_power_state(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    Json(req): Json<SetPowerStateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&ctx, &id)?;
    let resource = state
        .cluster()
        .placement()
        .set_power_state(&id, req.state)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(resource))
}

async fn move_resource(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    Json(req): Json<MoveResourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resource_id = parse_id(&ctx, &id)?;
    let placer: Placer = state.cluster().placement().clone();
    placer
        .get_resource(&resource_id)
        .await
        .map_err(|e| ctx.error(e))?;

    let scope = req
        .target
        .as_deref()
        .map(|target| TargetScope::parse(Some(target)));
    let operation_id = state
        .cluster()
        .operations()
        .spawn(OperationKind::Move, &id, move |op, cancel| async move {
            let request = MoveRequest {
                scope,
                live: req.live,
                operation_id: Some(op),
                ..MoveRequest::new(resource_id)
            };
            placer.relocate(request, &cancel).await
        })
        .await;
    Ok(accepted(operation_id, OperationKind::Move, id))
}
