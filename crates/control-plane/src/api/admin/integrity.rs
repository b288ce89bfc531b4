//! Agent integrity administration: reports, approvals, expected-hash
//! configuration, and trust scores.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use nw_events::{event_type, Event};

use crate::api::error::ApiResult;
use crate::api::guard::AdminGuard;
use crate::state::AppState;

/// GET /api/v1/admin/integrity/{node_id}
pub async fn report(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(node_id): Path<u64>,
) -> ApiResult<Response> {
    let node = state.registry.node(node_id)?;
    let expected = state.verifier.expected_hash(&node);
    let penalty = state.verifier.trust_penalty(&node);
    Ok(Json(json!({
        "node_id": node.id,
        "hostname": node.hostname,
        "expected_hash": expected,
        "agent_hash": node.agent_hash,
        "last_reported_hash": node.last_reported_hash,
        "hash_verified": node.hash_verified,
        "hash_mismatch_count": node.hash_mismatch_count,
        "trust_penalty": penalty,
    }))
    .into_response())
}

/// POST /api/v1/admin/integrity/{node_id}/approve
///
/// Bless the most recently reported hash as the expected one. 400 when
/// the agent has never reported a hash.
pub async fn approve(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(node_id): Path<u64>,
) -> ApiResult<Response> {
    let mut node = state.registry.node(node_id)?;
    let outcome = state.verifier.approve(&mut node)?;
    let events = state.registry.apply_integrity(node.clone(), outcome.audits)?;
    state.publish_all(events).await;
    state
        .bus
        .publish_async(Event::new(
            event_type::INTEGRITY_VERIFIED,
            json!({"node_id": node.id, "hostname": node.hostname, "approved": true}),
        ))
        .await;
    Ok(Json(node).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SetHashRequest {
    pub hash: Option<String>,
}

/// PUT /api/v1/admin/integrity/{node_id}/expected-hash
///
/// Pin (or clear, with `hash: null`) the node-specific expected hash.
pub async fn set_expected_hash(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Path(node_id): Path<u64>,
    Json(request): Json<SetHashRequest>,
) -> ApiResult<Response> {
    let (node, events) = state.registry.set_agent_hash(node_id, request.hash, "admin")?;
    state.publish_all(events).await;
    Ok(Json(node).into_response())
}

#[derive(Debug, Deserialize)]
pub struct GlobalHashRequest {
    pub hash: String,
}

/// PUT /api/v1/admin/integrity/global-hash
pub async fn set_global_hash(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Json(request): Json<GlobalHashRequest>,
) -> impl IntoResponse {
    state.verifier.set_global_expected_hash(request.hash);
    Json(json!({"global_expected_hash": state.verifier.global_expected_hash()}))
}

#[derive(Debug, Deserialize)]
pub struct KnownHashRequest {
    pub version: String,
    pub hash: String,
}

/// POST /api/v1/admin/integrity/known-hashes
pub async fn register_known_hash(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Json(request): Json<KnownHashRequest>,
) -> impl IntoResponse {
    state.verifier.register_known_hash(request.version, request.hash);
    Json(json!({"known_hashes": state.verifier.known_hashes()}))
}

/// GET /api/v1/admin/integrity/trust
///
/// Trust penalties across the fleet, worst first.
pub async fn trust_scores(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    let mut scores: Vec<_> = state
        .registry
        .list_nodes()
        .into_iter()
        .map(|node| {
            let penalty = state.verifier.trust_penalty(&node);
            json!({
                "node_id": node.id,
                "hostname": node.hostname,
                "status": node.status,
                "hash_verified": node.hash_verified,
                "hash_mismatch_count": node.hash_mismatch_count,
                "trust_penalty": penalty,
            })
        })
        .collect();
    scores.sort_by(|a, b| {
        let pa = a["trust_penalty"].as_f64().unwrap_or(0.0);
        let pb = b["trust_penalty"].as_f64().unwrap_or(0.0);
        pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
    });
    Json(json!({"scores": scores}))
}
