//! Running migrations: /v1/migrations

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use drover_id::MigrationId;

use super::ListResponse;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_migrations))
        .route("/{id}", delete(cancel_migration))
}

async fn list_migrations(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListResponse::from(
        state.cluster().transport().registry().list(),
    ))
}

/// Cancels a running migration; the source stays authoritative.
async fn cancel_migration(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: MigrationId = id.parse().map_err(|_| {
        ApiError::bad_request("invalid_migration_id", format!("invalid migration ID: {id}"))
            .with_request_id(ctx.request_id.clone())
    })?;

    if state.cluster().transport().registry().cancel(&id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(
            ApiError::not_found("migration_not_found", format!("no running migration {id}"))
                .with_request_id(ctx.request_id.clone()),
        )
    }
}
