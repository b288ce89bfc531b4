//! Node lifecycle management endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::api::error::ApiResult;
use crate::api::guard::AdminGuard;
use crate::state::AppState;

/// GET /api/v1/admin/nodes
pub async fn list(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    let nodes = state.registry.list_nodes();
    Json(serde_json::json!({
        "nodes": nodes,
        "count": nodes.len(),
    }))
}

/// GET /api/v1/admin/nodes/{id}
pub async fn get(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let node = state.registry.node(id)?;
    Ok(Json(node).into_response())
}

/// POST /api/v1/admin/nodes/{id}/approve
pub async fn approve(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let (node, events) = state.registry.approve_node(id, "admin")?;
    state.publish_all(events).await;
    Ok(Json(node).into_response())
}

/// POST /api/v1/admin/nodes/{id}/suspend
pub async fn suspend(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let (node, events) = state.registry.suspend_node(id, "admin")?;
    state.publish_all(events).await;
    Ok(Json(node).into_response())
}

/// POST /api/v1/admin/nodes/{id}/resume
pub async fn resume(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let (node, events) = state.registry.resume_node(id, "admin")?;
    state.publish_all(events).await;
    Ok(Json(node).into_response())
}

/// POST /api/v1/admin/nodes/{id}/revoke
pub async fn revoke(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let (node, events) = state.registry.revoke_node(id, "admin")?;
    state.publish_all(events).await;
    Ok(Json(node).into_response())
}

/// DELETE /api/v1/admin/nodes/{id}
pub async fn delete(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let events = state.registry.delete_node(id, "admin")?;
    state.publish_all(events).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}
