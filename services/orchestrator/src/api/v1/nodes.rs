//! Node endpoints.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hoster_id::{NodeId, RequestId};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::node::{Node, NodeStatus};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/{node_id}", get(get_node))
        .route("/nodes/{node_id}/release", post(release_workload))
        .route("/nodes/{node_id}/stop", post(stop_node))
}

#[derive(Debug, Deserialize)]
struct ListNodesQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListNodesResponse {
    items: Vec<Node>,
}

#[derive(Debug, Deserialize)]
struct ReleaseRequest {
    mem: i64,
    cpu: i32,
}

fn parse_node_id(raw: &str, request_id: &RequestId) -> Result<NodeId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_node_id", "Invalid node ID format")
            .with_request_id(request_id.to_string())
    })
}

async fn list_nodes(
    State(state): State<AppState>,
    Query(query): Query<ListNodesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = RequestId::new();

    let status = query
        .status
        .as_deref()
        .map(str::parse::<NodeStatus>)
        .transpose()
        .map_err(|e| {
            ApiError::bad_request("invalid_status", e.to_string())
                .with_request_id(request_id.to_string())
        })?;

    let items = state
        .orchestrator()
        .list_nodes(status)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.to_string()))?;

    Ok(Json(ListNodesResponse { items }))
}

async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = RequestId::new();
    let node_id = parse_node_id(&node_id, &request_id)?;

    let node = state
        .orchestrator()
        .get_node(node_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.to_string()))?;

    Ok(Json(node))
}

async fn release_workload(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(body): Json<ReleaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = RequestId::new();
    let node_id = parse_node_id(&node_id, &request_id)?;

    let node = state
        .orchestrator()
        .release_workload(node_id, body.mem, body.cpu)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.to_string()))?;

    Ok(Json(node))
}

async fn stop_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = RequestId::new();
    let node_id = parse_node_id(&node_id, &request_id)?;

    let node = state
        .orchestrator()
        .deprovision(node_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.to_string()))?;

    Ok(Json(node))
}
