//! Operation tracking: /v1/operations

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use drover_id::OperationId;
use serde::Serialize;

use super::ListResponse;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_operations))
        .route("/{id}", get(get_operation))
        .route("/{id}/cancel", post(cancel_operation))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub operation_id: OperationId,
    pub cancel_requested: bool,
}

fn parse_id(ctx: &RequestContext, id: &str) -> Result<OperationId, ApiError> {
    id.parse().map_err(|_| {
        ApiError::bad_request("invalid_operation_id", format!("invalid operation ID: {id}"))
            .with_request_id(ctx.request_id.clone())
    })
}

async fn list_operations(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListResponse::from(state.cluster().operations().list().await))
}

async fn get_operation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&ctx, &id)?;
    let operation = state.cluster().operations().get(&id).await.ok_or_else(|| {
        ApiError::not_found("operation_not_found", format!("operation {id} not found"))
            .with_request_id(ctx.request_id.clone())
    })?;
    Ok(Json(operation))
}

async fn cancel_operation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&ctx, &id)?;
    let operations = state.cluster().operations();
    if operations.get(&id).await.is_none() {
        return Err(
            ApiError::not_found("operation_not_found", format!("operation {id} not found"))
                .with_request_id(ctx.request_id.clone()),
        );
    }
    Ok(Json(CancelResponse {
        operation_id: id,
        cancel_requested: operations.cancel(&id).await,
    }))
}
