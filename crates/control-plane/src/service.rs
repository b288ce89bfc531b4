//! Agent-facing operations shared by the HTTP API and the push
//! channels: heartbeat processing (liveness + integrity), canonical
//! config assembly, and the authoritative hub peer sync.

use serde_json::json;

use nw_domain::model::Node;
use nw_domain::Result;
use nw_events::{event_type, Event};
use nw_protocol::{AgentConfig, HeartbeatResponse, HostMetrics, PeerSpec, SyncResult};

use crate::state::AppState;

/// Handle one heartbeat: run the integrity state machine when a hash
/// was reported, refresh liveness, and tell the agent whether a newer
/// config exists.
pub async fn process_heartbeat(
    state: &AppState,
    hostname: &str,
    metrics: Option<HostMetrics>,
    agent_hash: Option<String>,
    reported_version: Option<u64>,
    real_ip: Option<String>,
) -> Result<HeartbeatResponse> {
    let node = state.registry.node_by_hostname(hostname)?;

    if let Some(metrics) = &metrics {
        tracing::debug!(
            hostname = %hostname,
            load = ?metrics.load_avg,
            mem_available_kb = ?metrics.mem_available_kb,
            "heartbeat metrics"
        );
    }

    if let Some(reported) = agent_hash {
        verify_reported_hash(state, node, &reported).await?;
    }

    state.registry.touch_node(hostname, real_ip)?;

    let config_changed = reported_version
        .map(|v| v < state.registry.config_version())
        .unwrap_or(false);

    Ok(HeartbeatResponse { success: true, config_changed })
}

/// Run one reported hash through the verifier and persist the outcome.
async fn verify_reported_hash(state: &AppState, node: Node, reported: &str) -> Result<()> {
    let node_id = node.id;
    let hostname = node.hostname.clone();

    let mut updated = node;
    let outcome = state.verifier.verify(&mut updated, reported);
    let penalty = state.verifier.trust_penalty(&updated);
    let mismatch_count = updated.hash_mismatch_count;

    let lifecycle_events = state.registry.apply_integrity(updated, outcome.audits)?;

    let mut events = Vec::new();
    if outcome.valid {
        if outcome.action == nw_integrity::VerifyAction::Verified {
            events.push(Event::new(
                event_type::INTEGRITY_VERIFIED,
                json!({"node_id": node_id, "hostname": hostname}),
            ));
        }
    } else {
        events.push(Event::new(
            event_type::INTEGRITY_MISMATCH,
            json!({
                "node_id": node_id,
                "hostname": hostname,
                "mismatch_count": mismatch_count,
                "action": outcome.action.as_str(),
            }),
        ));
        if penalty > 0.0 {
            events.push(Event::new(
                event_type::TRUST_PENALTY_APPLIED,
                json!({"node_id": node_id, "hostname": hostname, "penalty": penalty}),
            ));
        }
    }
    events.extend(lifecycle_events);
    state.publish_all(events).await;
    Ok(())
}

/// Assemble the canonical config for one node: the hub peer, the
/// compiled ACL list, and the current config version.
pub fn build_agent_config(state: &AppState, node: &Node) -> AgentConfig {
    let snapshot = state.registry.snapshot();
    let acl_rules = nw_policy::compile_node_acl(node, &snapshot);

    let hub_peer = PeerSpec {
        public_key: state.config.hub_public_key.clone(),
        allowed_ips: state.config.overlay_network.to_string(),
        endpoint: Some(state.config.hub_endpoint.clone()),
        persistent_keepalive: 25,
    };

    AgentConfig {
        overlay_ip: node.overlay_ip.to_string(),
        hub_public_key: state.config.hub_public_key.clone(),
        hub_endpoint: state.config.hub_endpoint.clone(),
        peers: vec![hub_peer],
        acl_rules,
        config_version: snapshot.config_version,
        status: node.status,
    }
}

/// Authoritative reconciliation: push the registry-truth peer set to
/// the hub and publish the resulting diff.
pub async fn sync_hub_peers(state: &AppState) -> Result<SyncResult> {
    let snapshot = state.registry.snapshot();
    let peers = nw_policy::compile_peer_set(&snapshot);
    let result = state.hub.sync_peers(&peers).await?;

    tracing::info!(
        added = result.added,
        removed = result.removed,
        updated = result.updated,
        unchanged = result.unchanged,
        "hub peer set synced"
    );
    state
        .bus
        .publish_async(Event::new(
            event_type::PEERS_SYNCED,
            json!({
                "added": result.added,
                "removed": result.removed,
                "updated": result.updated,
                "unchanged": result.unchanged,
                "total": result.total,
                "errors": result.errors,
            }),
        ))
        .await;
    Ok(result)
}
