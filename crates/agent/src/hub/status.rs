//! Interface status and peer statistics snapshots served to the
//! control plane (`get_status`, `get_peer_stats`, periodic `status`
//! frames).

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use nw_domain::Result;

use crate::executor::TunnelExecutor;

/// Current interface facts plus peer count.
pub async fn interface_status(tunnel: &Arc<dyn TunnelExecutor>) -> Result<Value> {
    let mut status = tunnel.interface_status().await?;
    if let Value::Object(map) = &mut status {
        map.insert("timestamp".into(), json!(Utc::now()));
    }
    Ok(status)
}

/// Per-peer statistics. Transfer counters live behind the executor
/// boundary; what every backend can report is the configured set.
pub async fn peer_stats(tunnel: &Arc<dyn TunnelExecutor>) -> Result<Value> {
    let peers = tunnel.current_peers().await?;
    let stats: Vec<Value> = peers
        .iter()
        .map(|p| {
            json!({
                "public_key": p.public_key,
                "allowed_ips": p.allowed_ips,
                "endpoint": p.endpoint,
                "persistent_keepalive": p.persistent_keepalive,
            })
        })
        .collect();
    Ok(json!({
        "peer_count": peers.len(),
        "peers": stats,
        "timestamp": Utc::now(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InMemoryTunnel;
    use nw_protocol::PeerSpec;

    #[tokio::test]
    async fn status_carries_interface_and_timestamp() {
        let tunnel: Arc<dyn TunnelExecutor> = Arc::new(InMemoryTunnel::new("wg0"));
        let status = interface_status(&tunnel).await.unwrap();
        assert_eq!(status["interface"], "wg0");
        assert!(status.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn peer_stats_reflect_configured_peers() {
        let inner = Arc::new(InMemoryTunnel::new("wg0"));
        inner.add_peer(&PeerSpec::new("K1", "10.0.0.2/32")).await.unwrap();
        let tunnel: Arc<dyn TunnelExecutor> = inner;

        let stats = peer_stats(&tunnel).await.unwrap();
        assert_eq!(stats["peer_count"], 1);
        assert_eq!(stats["peers"][0]["public_key"], "K1");
    }
}
