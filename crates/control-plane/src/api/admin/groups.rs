//! Group and membership management endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use nw_domain::model::MemberRole;
use nw_registry::store::{GroupUpdate, NewGroup};

use crate::api::error::ApiResult;
use crate::api::guard::AdminGuard;
use crate::state::AppState;

/// GET /api/v1/admin/groups
pub async fn list(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    let groups = state.registry.list_groups();
    Json(serde_json::json!({
        "groups": groups,
        "count": groups.len(),
    }))
}

/// GET /api/v1/admin/groups/{id}
pub async fn get(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    Ok(Json(state.registry.group(id)?).into_response())
}

/// POST /api/v1/admin/groups
pub async fn create(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Json(new): Json<NewGroup>,
) -> ApiResult<Response> {
    let (group, events) = state.registry.create_group(new, "admin")?;
    state.publish_all(events).await;
    Ok((StatusCode::CREATED, Json(group)).into_response())
}

/// PUT /api/v1/admin/groups/{id}
pub async fn update(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
    Json(update): Json<GroupUpdate>,
) -> ApiResult<Response> {
    let (group, events) = state.registry.update_group(id, update, "admin")?;
    state.publish_all(events).await;
    Ok(Json(group).into_response())
}

/// DELETE /api/v1/admin/groups/{id}
pub async fn delete(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let events = state.registry.delete_group(id, "admin")?;
    state.publish_all(events).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Memberships ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: u64,
    #[serde(default = "default_member_role")]
    pub role: MemberRole,
}

fn default_member_role() -> MemberRole {
    MemberRole::Member
}

/// GET /api/v1/admin/groups/{id}/members
pub async fn list_members(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let members = state.registry.list_members(id)?;
    Ok(Json(serde_json::json!({
        "members": members,
        "count": members.len(),
    }))
    .into_response())
}

/// POST /api/v1/admin/groups/{id}/members
pub async fn add_member(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
    Json(request): Json<AddMemberRequest>,
) -> ApiResult<Response> {
    let (membership, events) = state
        .registry
        .add_member(id, request.user_id, request.role, "admin")?;
    state.publish_all(events).await;
    Ok((StatusCode::CREATED, Json(membership)).into_response())
}

/// DELETE /api/v1/admin/groups/{id}/members/{user_id}
pub async fn remove_member(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path((id, user_id)): Path<(u64, u64)>,
) -> ApiResult<Response> {
    let events = state.registry.remove_member(id, user_id, "admin")?;
    state.publish_all(events).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Bulk membership ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BulkAddRequest {
    pub user_ids: Vec<u64>,
    #[serde(default = "default_member_role")]
    pub role: MemberRole,
}

#[derive(Debug, Serialize)]
pub struct BulkItemResult {
    pub user_id: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POST /api/v1/admin/groups/{id}/members/bulk
///
/// Per-item success/failure rather than all-or-nothing: one bad user id
/// does not sink the rest of the batch.
pub async fn bulk_add_members(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
    Json(request): Json<BulkAddRequest>,
) -> ApiResult<Response> {
    let mut results = Vec::with_capacity(request.user_ids.len());
    for user_id in request.user_ids {
        match state.registry.add_member(id, user_id, request.role, "admin") {
            Ok((_, events)) => {
                state.publish_all(events).await;
                results.push(BulkItemResult { user_id, success: true, error: None });
            }
            Err(e) => results.push(BulkItemResult {
                user_id,
                success: false,
                error: Some(e.to_string()),
            }),
        }
    }

    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;
    Ok(Json(serde_json::json!({
        "results": results,
        "succeeded": succeeded,
        "failed": failed,
    }))
    .into_response())
}
