//! Placement requests: /v1/placements

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};

use super::record_call;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::operations::OperationKind;
use crate::placement::PlacementRequest;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", post(place))
}

async fn place(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<PlacementRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = req.name.clone();
    let outcome = state.cluster().placement().place(req).await;
    let body = record_call(&state, &ctx, OperationKind::Placement, &target, outcome).await?;
    Ok((StatusCode::CREATED, body))
}
