//! Placement endpoint.
//!
//! `POST /v1/placements` places a workload on an existing node or provisions
//! a new one. It can take as long as a full provisioning workflow.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use hoster_id::RequestId;

use crate::api::error::ApiError;
use crate::node::PlacementRequest;
use crate::orchestrator::PlacementOrigin;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/placements", post(create_placement))
}

async fn create_placement(
    State(state): State<AppState>,
    Json(request): Json<PlacementRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = RequestId::new();

    let placement = state
        .orchestrator()
        .place_workload(request)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.to_string()))?;

    let status = match placement.origin {
        PlacementOrigin::Existing => StatusCode::OK,
        PlacementOrigin::Provisioned => StatusCode::CREATED,
    };
    Ok((status, Json(placement)))
}
