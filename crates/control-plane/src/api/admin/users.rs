//! User management endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use nw_registry::store::{NewUser, UserUpdate};

use crate::api::error::ApiResult;
use crate::api::guard::AdminGuard;
use crate::state::AppState;

/// GET /api/v1/admin/users
pub async fn list(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    let users = state.registry.list_users();
    Json(serde_json::json!({
        "users": users,
        "count": users.len(),
    }))
}

/// GET /api/v1/admin/users/{id}
pub async fn get(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    Ok(Json(state.registry.user(id)?).into_response())
}

/// POST /api/v1/admin/users
pub async fn create(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Json(new): Json<NewUser>,
) -> ApiResult<Response> {
    let (user, events) = state.registry.create_user(new, "admin")?;
    state.publish_all(events).await;
    Ok((StatusCode::CREATED, Json(user)).into_response())
}

/// PUT /api/v1/admin/users/{id}
pub async fn update(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
    Json(update): Json<UserUpdate>,
) -> ApiResult<Response> {
    let (user, events) = state.registry.update_user(id, update, "admin")?;
    state.publish_all(events).await;
    Ok(Json(user).into_response())
}

/// DELETE /api/v1/admin/users/{id}
pub async fn delete(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let events = state.registry.delete_user(id, "admin")?;
    state.publish_all(events).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}
