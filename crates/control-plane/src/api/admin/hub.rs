//! Hub peer management and connected-agent introspection.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};

use crate::api::error::ApiResult;
use crate::api::guard::AdminGuard;
use crate::service;
use crate::state::AppState;

/// GET /api/v1/admin/hub/status
pub async fn status(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    Json(state.hub.info())
}

/// POST /api/v1/admin/hub/sync
///
/// Force the authoritative peer reconciliation now. 503 when the hub
/// channel is down.
pub async fn sync(State(state): State<AppState>, _guard: AdminGuard) -> ApiResult<Response> {
    let result = service::sync_hub_peers(&state).await?;
    Ok(Json(result).into_response())
}

/// GET /api/v1/admin/hub/peers
pub async fn peers(State(state): State<AppState>, _guard: AdminGuard) -> ApiResult<Response> {
    Ok(Json(state.hub.get_peers().await?).into_response())
}

/// GET /api/v1/admin/hub/peer-stats
pub async fn peer_stats(State(state): State<AppState>, _guard: AdminGuard) -> ApiResult<Response> {
    Ok(Json(state.hub.get_peer_stats().await?).into_response())
}

/// POST /api/v1/admin/hub/restart
pub async fn restart(State(state): State<AppState>, _guard: AdminGuard) -> ApiResult<Response> {
    Ok(Json(state.hub.restart_interface().await?).into_response())
}

/// GET /api/v1/admin/agents — currently connected node agents.
pub async fn agents(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    let agents = state.agents.list();
    Json(serde_json::json!({
        "agents": agents,
        "count": agents.len(),
    }))
}
