//! Policy management: the rich access model, the legacy role-pair
//! rules, built-in templates, and ad-hoc access evaluation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use nw_domain::model::AccessContext;
use nw_domain::Error;
use nw_policy::{evaluate_access, templates, ResourceQuery};
use nw_registry::store::{NewAccessPolicy, NewAclPolicy};

use crate::api::error::{ApiError, ApiResult};
use crate::api::guard::AdminGuard;
use crate::state::AppState;

// ── Rich access policies ─────────────────────────────────────────────

/// GET /api/v1/admin/policies
pub async fn list(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    let policies = state.registry.list_policies();
    Json(serde_json::json!({
        "policies": policies,
        "count": policies.len(),
    }))
}

/// GET /api/v1/admin/policies/{id}
pub async fn get(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    Ok(Json(state.registry.policy(id)?).into_response())
}

/// POST /api/v1/admin/policies
pub async fn create(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Json(new): Json<NewAccessPolicy>,
) -> ApiResult<Response> {
    let (policy, events) = state.registry.create_policy(new, "admin")?;
    state.publish_all(events).await;
    Ok((StatusCode::CREATED, Json(policy)).into_response())
}

/// PUT /api/v1/admin/policies/{id}
pub async fn update(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
    Json(new): Json<NewAccessPolicy>,
) -> ApiResult<Response> {
    let (policy, events) = state.registry.update_policy(id, new, "admin")?;
    state.publish_all(events).await;
    Ok(Json(policy).into_response())
}

/// DELETE /api/v1/admin/policies/{id}
pub async fn delete(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let events = state.registry.delete_policy(id, "admin")?;
    state.publish_all(events).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Legacy role-pair ACL rules ───────────────────────────────────────

/// GET /api/v1/admin/acl-policies
pub async fn list_acl(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    let policies = state.registry.list_acl_policies();
    Json(serde_json::json!({
        "policies": policies,
        "count": policies.len(),
    }))
}

/// GET /api/v1/admin/acl-policies/{id}
pub async fn get_acl(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    Ok(Json(state.registry.acl_policy(id)?).into_response())
}

/// POST /api/v1/admin/acl-policies
pub async fn create_acl(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Json(new): Json<NewAclPolicy>,
) -> ApiResult<Response> {
    let (policy, events) = state.registry.create_acl_policy(new, "admin")?;
    state.publish_all(events).await;
    Ok((StatusCode::CREATED, Json(policy)).into_response())
}

/// PUT /api/v1/admin/acl-policies/{id}
pub async fn update_acl(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
    Json(new): Json<NewAclPolicy>,
) -> ApiResult<Response> {
    let (policy, events) = state.registry.update_acl_policy(id, new, "admin")?;
    state.publish_all(events).await;
    Ok(Json(policy).into_response())
}

/// DELETE /api/v1/admin/acl-policies/{id}
pub async fn delete_acl(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let events = state.registry.delete_acl_policy(id, "admin")?;
    state.publish_all(events).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Templates ────────────────────────────────────────────────────────

/// GET /api/v1/admin/templates
pub async fn list_templates(_guard: AdminGuard) -> impl IntoResponse {
    Json(serde_json::json!({"templates": templates::builtin()}))
}

/// POST /api/v1/admin/templates/{key}/instantiate
pub async fn instantiate_template(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(key): Path<String>,
) -> ApiResult<Response> {
    let template = templates::find(&key)
        .ok_or_else(|| Error::NotFound(format!("template {key}")))?;
    let (policy, events) = state
        .registry
        .create_acl_policy(template.instantiate(), "admin")?;
    state.publish_all(events).await;
    Ok((StatusCode::CREATED, Json(policy)).into_response())
}

// ── Access evaluation ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub user_id: u64,
    pub resource_type: String,
    pub value: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub via_vpn: bool,
}

/// POST /api/v1/admin/access/evaluate
pub async fn evaluate(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Json(request): Json<EvaluateRequest>,
) -> ApiResult<Response> {
    let query = match request.resource_type.as_str() {
        "domain" => ResourceQuery::Domain(request.value),
        "ip_range" | "ip" => ResourceQuery::Ip(
            request
                .value
                .parse()
                .map_err(|e| ApiError(Error::Invalid(format!("ip \"{}\": {e}", request.value))))?,
        ),
        "zone" => ResourceQuery::Zone(request.value),
        "service" => ResourceQuery::Service(request.value),
        "url_pattern" | "url" => ResourceQuery::Url(request.value),
        other => {
            return Err(ApiError(Error::Invalid(format!(
                "unknown resource type: {other}"
            ))))
        }
    };

    let client_ip = match request.client_ip {
        Some(raw) => Some(
            raw.parse()
                .map_err(|e| ApiError(Error::Invalid(format!("client_ip \"{raw}\": {e}"))))?,
        ),
        None => None,
    };
    let ctx = AccessContext {
        device_type: request.device_type,
        client_ip,
        via_vpn: request.via_vpn,
        timestamp: None,
    };

    // Evaluation also works for unknown users (no memberships, so only
    // subject=all policies apply), but flag it for the caller.
    let known_user = state.registry.user(request.user_id).is_ok();
    let snapshot = state.registry.snapshot();
    let decision = evaluate_access(&snapshot, request.user_id, &query, &ctx);

    Ok(Json(serde_json::json!({
        "decision": decision,
        "known_user": known_user,
    }))
    .into_response())
}
