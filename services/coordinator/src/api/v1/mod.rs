//! API v1 routes.

mod cluster;
mod groups;
mod members;
mod migrations;
mod operations;
mod placements;
mod resources;

use axum::{http::StatusCode, response::IntoResponse, Json, Router};
use drover_id::OperationId;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::ClusterResult;
use crate::operations::{OperationKind, OperationStatus};
use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/placements", placements::routes())
        .nest("/cluster", cluster::routes())
        .nest("/members", members::routes())
        .nest("/groups", groups::routes())
        .merge(groups::project_routes())
        .nest("/resources", resources::routes())
        .nest("/operations", operations::routes())
        .nest("/migrations", migrations::routes())
}

/// Body of a synchronous call: the result plus the operation that tracked it.
#[derive(Debug, Serialize)]
pub struct CallResponse<T> {
    pub operation_id: OperationId,
    #[serde(flatten)]
    pub result: T,
}

/// Body of a `202 Accepted` for work continuing in the background.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub target: String,
    pub status: OperationStatus,
}

/// Records `outcome` as a finished operation and turns it into a response.
async fn record_call<T: Serialize>(
    state: &AppState,
    ctx: &RequestContext,
    kind: OperationKind,
    target: &str,
    outcome: ClusterResult<T>,
) -> Result<Json<CallResponse<T>>, ApiError> {
    let operation_id = state
        .cluster()
        .operations()
        .record(kind, target, &outcome)
        .await;
    match outcome {
        Ok(result) => Ok(Json(CallResponse {
            operation_id,
            result,
        })),
        Err(e) => Err(ctx.error(e)),
    }
}

fn accepted(operation_id: OperationId, kind: OperationKind, target: String) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            operation_id,
            kind,
            target,
            status: OperationStatus::Pending,
        }),
    )
}

/// List wrapper.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}
