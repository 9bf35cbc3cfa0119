//! Join tokens and join redemption: /v1/cluster

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post},
    Json, Router,
};
use drover_id::TokenId;
use serde::{Deserialize, Serialize};

use super::{record_call, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::join::JoinRequest;
use crate::operations::OperationKind;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tokens", post(issue_token).get(list_tokens))
        .route("/tokens/{name}", delete(revoke_token))
        .route("/join", post(join))
}

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    /// Name the joining server will take.
    pub server_name: String,
    /// Require the joiner to present this certificate fingerprint.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RevokeTokenResponse {
    pub id: TokenId,
    pub server_name: String,
}

async fn issue_token(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<IssueTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let requester = ctx
        .member
        .clone()
        .unwrap_or_else(|| state.local_member().to_string());
    let outcome = state
        .cluster()
        .join()
        .issue_token(&requester, &req.server_name, req.fingerprint)
        .await;
    let body = record_call(
        &state,
        &ctx,
        OperationKind::JoinToken,
        &req.server_name,
        outcome,
    )
    .await?;
    Ok((StatusCode::CREATED, body))
}

async fn list_tokens(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let tokens = state
        .cluster()
        .join()
        .list_tokens()
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::from(tokens)))
}

async fn revoke_token(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .cluster()
        .join()
        .revoke_token(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(RevokeTokenResponse {
        id,
        server_name: name,
    }))
}

async fn join(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<JoinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = req.address.clone();
    let outcome = state.cluster().join().redeem_token(req).await;
    record_call(&state, &ctx, OperationKind::Join, &target, outcome).await
}
