//! Agent-facing HTTP endpoints: registration, canonical config, and
//! heartbeat. The push channels only carry invalidations; these
//! endpoints are the authoritative read/write surface for agents.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use nw_domain::model::NodeStatus;
use nw_domain::Error;
use nw_protocol::{HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse};
use nw_registry::store::NewNode;

use crate::api::error::{forbidden, ApiError, ApiResult};
use crate::handlers;
use crate::service;
use crate::state::AppState;

/// POST /api/v1/agent/register
///
/// Idempotent on `(hostname, public_key)`: repeating the call returns
/// the same node id and overlay IP. A colliding hostname or key with a
/// different pairing is a 409.
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Response> {
    let outcome = state
        .registry
        .register_node(NewNode {
            hostname: request.hostname,
            role: request.role,
            public_key: request.public_key,
            os_info: request.os_info,
            agent_version: request.agent_version,
        })
        .map_err(|e| {
            if matches!(e, Error::PoolExhausted) {
                // Publish after the failed transaction; fire-and-forget.
                let state = state.clone();
                tokio::spawn(async move { handlers::publish_pool_exhausted(&state).await });
            }
            ApiError(e)
        })?;

    let created = outcome.created;
    if created {
        tracing::info!(
            hostname = %outcome.node.hostname,
            overlay_ip = %outcome.node.overlay_ip,
            peer = %peer,
            "node registered"
        );
    }
    state.publish_all(outcome.events).await;

    let node = outcome.node;
    let body = RegisterResponse {
        node_id: node.id,
        overlay_ip: node.overlay_ip.to_string(),
        hub_public_key: state.config.hub_public_key.clone(),
        hub_endpoint: state.config.hub_endpoint.clone(),
        allowed_ips: state.config.overlay_network.to_string(),
        dns_servers: state.config.dns_servers.clone(),
        status: node.status,
    };
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ConfigQuery {
    pub hostname: String,
}

/// GET /api/v1/agent/config?hostname=…
///
/// 403 unless the node is active. Doubles as a liveness signal: the
/// fetch refreshes `last_seen` and the observed source address.
pub async fn get_config(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<ConfigQuery>,
) -> ApiResult<Response> {
    let node = state.registry.node_by_hostname(&query.hostname)?;
    if node.status != NodeStatus::Active {
        return Ok(forbidden(format!("node status is {}", node.status)));
    }

    let node = state
        .registry
        .touch_node(&query.hostname, Some(peer.ip().to_string()))?;

    let config = service::build_agent_config(&state, &node);
    Ok(Json(config).into_response())
}

/// POST /api/v1/agent/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let node = state.registry.node_by_hostname(&request.hostname)?;
    if node.public_key != request.public_key {
        return Err(ApiError(Error::Unauthorized("public key mismatch".into())));
    }

    let response = service::process_heartbeat(
        &state,
        &request.hostname,
        request.metrics,
        request.agent_hash,
        request.config_version,
        Some(peer.ip().to_string()),
    )
    .await?;
    Ok(Json(response))
}
