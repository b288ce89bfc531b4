//! Network observability: stats, IP allocations, event history, and
//! the audit trail.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use nw_registry::IpOwner;

use crate::api::error::ApiResult;
use crate::api::guard::AdminGuard;
use crate::state::AppState;

/// GET /api/v1/admin/stats
pub async fn stats(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    let nodes = state.registry.list_nodes();

    let mut by_status: HashMap<&str, usize> = HashMap::new();
    let mut by_role: HashMap<&str, usize> = HashMap::new();
    for node in &nodes {
        *by_status.entry(node.status.as_str()).or_default() += 1;
        *by_role.entry(node.role.as_str()).or_default() += 1;
    }

    Json(json!({
        "nodes": {
            "total": nodes.len(),
            "by_status": by_status,
            "by_role": by_role,
        },
        "config_version": state.registry.config_version(),
        "connected_agents": state.agents.count(),
        "hub_connected": state.hub.is_connected(),
        "ip_pool": {
            "network": state.config.overlay_network.to_string(),
            "available": state.registry.ip_pool_available(),
        },
    }))
}

/// GET /api/v1/admin/allocations — current IP leases.
pub async fn allocations(State(state): State<AppState>, _guard: AdminGuard) -> impl IntoResponse {
    let allocations: Vec<_> = state
        .registry
        .ip_allocations()
        .into_iter()
        .map(|(ip, owner)| {
            let (kind, id) = match owner {
                IpOwner::Node(id) => ("node", id),
                IpOwner::Client(id) => ("client", id),
            };
            json!({"ip": ip.to_string(), "owner_type": kind, "owner_id": id})
        })
        .collect();
    Json(json!({
        "allocations": allocations,
        "count": allocations.len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// GET /api/v1/admin/events — persisted event history.
pub async fn events(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let events = state
        .registry
        .event_store()
        .recent(query.event_type.as_deref(), query.limit)?;
    Ok(Json(json!({
        "events": events,
        "count": events.len(),
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// GET /api/v1/admin/audit — recent audit rows.
pub async fn audit(
    State(state): State<AppState>,
    _guard: AdminGuard,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Response> {
    let records = state.registry.audit_log().recent(query.limit)?;
    Ok(Json(json!({
        "records": records,
        "count": records.len(),
    }))
    .into_response())
}
