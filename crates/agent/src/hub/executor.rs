//! Command execution on the hub agent.
//!
//! Commands arriving on the channel dispatch through an explicit
//! `command → handler` table; an unknown command is an error result,
//! never a dropped frame. Every execution produces a result frame with
//! `success`, `data` and `error` fields.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};

use nw_protocol::{HubCommand, PeerSpec};

use crate::executor::TunnelExecutor;
use crate::hub::peers::PeerManager;
use crate::hub::status;

/// Outcome of one command execution, ready to frame.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl CommandResult {
    fn ok(data: Value) -> Self {
        CommandResult { success: true, data: Some(data), error: None }
    }

    fn err(message: impl Into<String>) -> Self {
        CommandResult { success: false, data: None, error: Some(message.into()) }
    }
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Routes commands from the control plane to the peer manager and the
/// tunnel executor.
pub struct CommandExecutor {
    handlers: HashMap<HubCommand, Handler>,
}

impl CommandExecutor {
    pub fn new(peers: Arc<PeerManager>, tunnel: Arc<dyn TunnelExecutor>) -> Self {
        let mut handlers: HashMap<HubCommand, Handler> = HashMap::new();

        {
            let peers = peers.clone();
            handlers.insert(
                HubCommand::AddPeer,
                Arc::new(move |payload| {
                    let peers = peers.clone();
                    Box::pin(async move {
                        let peer = parse_peer(&payload)?;
                        let public_key = peer.public_key.clone();
                        let allowed_ips = peer.allowed_ips.clone();
                        peers.add_peer(peer).await?;
                        Ok(json!({
                            "public_key": public_key,
                            "allowed_ips": allowed_ips,
                            "status": "added",
                        }))
                    })
                }),
            );
        }

        {
            let peers = peers.clone();
            handlers.insert(
                HubCommand::RemovePeer,
                Arc::new(move |payload| {
                    let peers = peers.clone();
                    Box::pin(async move {
                        let public_key = require_str(&payload, "public_key")?;
                        peers.remove_peer(&public_key).await?;
                        Ok(json!({"public_key": public_key, "status": "removed"}))
                    })
                }),
            );
        }

        {
            let peers = peers.clone();
            handlers.insert(
                HubCommand::UpdatePeer,
                Arc::new(move |payload| {
                    let peers = peers.clone();
                    Box::pin(async move {
                        let public_key = require_str(&payload, "public_key")?;
                        let allowed_ips = payload["allowed_ips"].as_str().map(String::from);
                        peers.update_peer(&public_key, allowed_ips.as_deref()).await?;
                        Ok(json!({"public_key": public_key, "status": "updated"}))
                    })
                }),
            );
        }

        {
            let peers = peers.clone();
            handlers.insert(
                HubCommand::SyncPeers,
                Arc::new(move |payload| {
                    let peers = peers.clone();
                    Box::pin(async move {
                        let desired: Vec<PeerSpec> =
                            serde_json::from_value(payload["peers"].clone())
                                .map_err(|e| anyhow::anyhow!("peers list: {e}"))?;
                        let result = peers.sync_peers(desired).await?;
                        Ok(serde_json::to_value(result)?)
                    })
                }),
            );
        }

        {
            let tunnel = tunnel.clone();
            handlers.insert(
                HubCommand::GetPeers,
                Arc::new(move |_payload| {
                    let tunnel = tunnel.clone();
                    Box::pin(async move {
                        let peers = tunnel.current_peers().await?;
                        Ok(json!({"peers": peers, "count": peers.len()}))
                    })
                }),
            );
        }

        {
            let tunnel = tunnel.clone();
            handlers.insert(
                HubCommand::GetStatus,
                Arc::new(move |_payload| {
                    let tunnel = tunnel.clone();
                    Box::pin(async move { status::interface_status(&tunnel).await.map_err(Into::into) })
                }),
            );
        }

        {
            let tunnel = tunnel.clone();
            handlers.insert(
                HubCommand::GetPeerStats,
                Arc::new(move |_payload| {
                    let tunnel = tunnel.clone();
                    Box::pin(async move { status::peer_stats(&tunnel).await.map_err(Into::into) })
                }),
            );
        }

        {
            let tunnel = tunnel.clone();
            handlers.insert(
                HubCommand::RestartInterface,
                Arc::new(move |_payload| {
                    let tunnel = tunnel.clone();
                    Box::pin(async move {
                        tunnel.restart().await?;
                        Ok(json!({"status": "restarted"}))
                    })
                }),
            );
        }

        handlers.insert(
            HubCommand::Ping,
            Arc::new(|_payload| Box::pin(async { Ok(json!({"pong": true})) })),
        );

        CommandExecutor { handlers }
    }

    /// Execute one command by name.
    pub async fn execute(&self, command: &str, payload: Value) -> CommandResult {
        let Some(kind) = HubCommand::parse(command) else {
            tracing::warn!(command = %command, "unknown command");
            return CommandResult::err(format!("unknown command: {command}"));
        };
        let handler = match self.handlers.get(&kind) {
            Some(h) => h.clone(),
            None => return CommandResult::err(format!("no handler for command: {command}")),
        };

        tracing::info!(command = %command, "executing command");
        match handler(payload).await {
            Ok(data) => CommandResult::ok(data),
            Err(e) => {
                tracing::error!(command = %command, error = %e, "command failed");
                CommandResult::err(e.to_string())
            }
        }
    }
}

fn require_str(payload: &Value, field: &str) -> anyhow::Result<String> {
    payload[field]
        .as_str()
        .map(String::from)
        .ok_or_else(|| anyhow::anyhow!("{field} required"))
}

fn parse_peer(payload: &Value) -> anyhow::Result<PeerSpec> {
    let public_key = require_str(payload, "public_key")?;
    let allowed_ips = require_str(payload, "allowed_ips")?;
    Ok(PeerSpec {
        public_key,
        allowed_ips,
        endpoint: payload["endpoint"].as_str().map(String::from),
        persistent_keepalive: payload["persistent_keepalive"].as_u64().unwrap_or(0) as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InMemoryTunnel;

    fn executor() -> (Arc<InMemoryTunnel>, CommandExecutor) {
        let tunnel = Arc::new(InMemoryTunnel::new("wg0"));
        let dyn_tunnel: Arc<dyn TunnelExecutor> = tunnel.clone();
        let peers = Arc::new(PeerManager::new(dyn_tunnel.clone()));
        (tunnel, CommandExecutor::new(peers, dyn_tunnel))
    }

    #[tokio::test]
    async fn add_and_remove_peer_round_trip() {
        let (tunnel, exec) = executor();

        let result = exec
            .execute(
                "add_peer",
                json!({"public_key": "K1", "allowed_ips": "10.0.0.2/32", "persistent_keepalive": 25}),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["status"], "added");
        assert_eq!(tunnel.current_peers().await.unwrap().len(), 1);

        let result = exec.execute("remove_peer", json!({"public_key": "K1"})).await;
        assert!(result.success);
        assert!(tunnel.current_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_peer_requires_fields() {
        let (_, exec) = executor();
        let result = exec.execute("add_peer", json!({"public_key": "K1"})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("allowed_ips"));
    }

    #[tokio::test]
    async fn sync_peers_returns_diff() {
        let (_, exec) = executor();
        exec.execute("add_peer", json!({"public_key": "K2", "allowed_ips": "10.0.0.3/32"}))
            .await;

        let result = exec
            .execute(
                "sync_peers",
                json!({"peers": [
                    {"public_key": "K1", "allowed_ips": "10.0.0.2/32"},
                    {"public_key": "K3", "allowed_ips": "10.0.0.4/32"},
                ]}),
            )
            .await;
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["added"], 2);
        assert_eq!(data["removed"], 1);
        assert_eq!(data["total"], 2);
    }

    #[tokio::test]
    async fn unknown_command_is_an_error_result() {
        let (_, exec) = executor();
        let result = exec.execute("flush_everything", json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown command"));
    }

    #[tokio::test]
    async fn status_and_stats_and_ping() {
        let (_, exec) = executor();

        let status = exec.execute("get_status", json!({})).await;
        assert!(status.success);
        assert_eq!(status.data.unwrap()["interface"], "wg0");

        let stats = exec.execute("get_peer_stats", json!({})).await;
        assert!(stats.success);

        let pong = exec.execute("ping", json!({})).await;
        assert!(pong.success);
        assert_eq!(pong.data.unwrap()["pong"], true);
    }

    #[tokio::test]
    async fn restart_reaches_the_tunnel() {
        let (tunnel, exec) = executor();
        let result = exec.execute("restart_interface", json!({})).await;
        assert!(result.success);
        assert_eq!(tunnel.restart_count(), 1);
    }
}
