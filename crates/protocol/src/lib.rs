//! Wire protocol between the control plane and its agents.
//!
//! Two channels exist: the hub command channel (request/response over a
//! single long-lived socket) and the node push channel (invalidation
//! fan-out to many agents). Both carry JSON frames tagged by `type`.
//! The node push channel is notification-only; the authoritative config
//! always travels over the idempotent HTTP read in [`AgentConfig`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use nw_domain::model::{NodeRole, NodeStatus, Protocol, RuleAction};

/// WebSocket close code for failed authentication.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// WebSocket close code when a newer connection supersedes this one.
pub const CLOSE_SUPERSEDED: u16 = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub command channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frame envelope on the hub command channel.
///
/// Outbound commands carry a monotonically increasing `cmd_<n>` id the
/// hub echoes back in its `response` / `command_result` frame. Older
/// hub agents answer with `command_result`; both spell the correlation
/// id as either `id` or `command_id`, hence the serde aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    /// Control plane → hub: connection accepted.
    Welcome { timestamp: DateTime<Utc> },

    /// Control plane → hub: execute a command.
    Command {
        #[serde(alias = "command_id")]
        id: String,
        command: String,
        payload: Value,
        timestamp: DateTime<Utc>,
    },

    /// Hub → control plane: initial status report after connect.
    Hello {
        #[serde(default)]
        status: Value,
        timestamp: DateTime<Utc>,
    },

    /// Hub → control plane: command outcome.
    Response {
        #[serde(alias = "command_id")]
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Legacy spelling of [`HubFrame::Response`].
    CommandResult {
        #[serde(alias = "command_id")]
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Hub → control plane: unsolicited periodic status.
    Status { data: Value },

    /// Bidirectional keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
}

/// Commands the hub channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubCommand {
    AddPeer,
    RemovePeer,
    UpdatePeer,
    SyncPeers,
    GetPeers,
    GetStatus,
    GetPeerStats,
    RestartInterface,
    Ping,
}

impl HubCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubCommand::AddPeer => "add_peer",
            HubCommand::RemovePeer => "remove_peer",
            HubCommand::UpdatePeer => "update_peer",
            HubCommand::SyncPeers => "sync_peers",
            HubCommand::GetPeers => "get_peers",
            HubCommand::GetStatus => "get_status",
            HubCommand::GetPeerStats => "get_peer_stats",
            HubCommand::RestartInterface => "restart_interface",
            HubCommand::Ping => "ping",
        }
    }

    pub fn parse(s: &str) -> Option<HubCommand> {
        match s {
            "add_peer" => Some(HubCommand::AddPeer),
            "remove_peer" => Some(HubCommand::RemovePeer),
            "update_peer" => Some(HubCommand::UpdatePeer),
            "sync_peers" => Some(HubCommand::SyncPeers),
            "get_peers" => Some(HubCommand::GetPeers),
            "get_status" => Some(HubCommand::GetStatus),
            "get_peer_stats" => Some(HubCommand::GetPeerStats),
            "restart_interface" => Some(HubCommand::RestartInterface),
            "ping" => Some(HubCommand::Ping),
            _ => None,
        }
    }
}

/// A tunnel peer as the hub sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub public_key: String,
    /// Single-host `/32` for node peers.
    pub allowed_ips: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub persistent_keepalive: u16,
}

impl PeerSpec {
    pub fn new(public_key: impl Into<String>, allowed_ips: impl Into<String>) -> Self {
        PeerSpec {
            public_key: public_key.into(),
            allowed_ips: allowed_ips.into(),
            endpoint: None,
            persistent_keepalive: 0,
        }
    }
}

/// Diff returned by a `sync_peers` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node push channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frame envelope on the node push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Agent → control plane: keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Control plane → agent: keepalive answer.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Agent → control plane: liveness + metrics + integrity hash.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<HostMetrics>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_hash: Option<String>,
        /// Last config version the agent applied, so the ack can say
        /// whether a re-fetch is worthwhile.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config_version: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    /// Control plane → agent: heartbeat received.
    HeartbeatAck {
        #[serde(default)]
        config_changed: bool,
    },

    /// Control plane → agent: config invalidation. The agent re-fetches
    /// the canonical config over HTTP; the frame carries no payload.
    ConfigUpdated { timestamp: DateTime<Utc> },

    /// Control plane → agent: lifecycle status change.
    StatusChanged { status: NodeStatus },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ACL wire shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known descriptions of the three trailing rules every compiled
/// ACL ends with. Firewall executors key on these to install the
/// stateful/ICMP forms their backend needs.
pub mod trailer {
    pub const ESTABLISHED: &str = "established,related";
    pub const ICMP_ECHO: &str = "icmp echo-request";
    pub const DEFAULT_DROP: &str = "default drop";
}

/// One compiled ACL entry as shipped to a node agent.
///
/// The list the control plane ships is already specificity-sorted; the
/// agent installs entries in order and the trailing default-drop closes
/// the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAclRule {
    /// Source CIDR, `a.b.c.d/32` for node peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<String>,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent HTTP payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    pub role: NodeRole,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: u64,
    pub overlay_ip: String,
    pub hub_public_key: String,
    pub hub_endpoint: String,
    /// CIDR the agent routes into the tunnel (the overlay network).
    pub allowed_ips: String,
    pub dns_servers: Vec<String>,
    pub status: NodeStatus,
}

/// Canonical config served over HTTP; the only authoritative source of
/// peers and ACLs for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub overlay_ip: String,
    pub hub_public_key: String,
    pub hub_endpoint: String,
    pub peers: Vec<PeerSpec>,
    pub acl_rules: Vec<WireAclRule>,
    /// Ordering oracle: agents refuse to apply a version ≤ the last
    /// applied one.
    pub config_version: u64,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub hostname: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HostMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_hash: Option<String>,
    /// Last config version the agent applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub config_changed: bool,
}

/// Host facts collected by the agent and attached to heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_avg: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_total_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_available_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

/// Uniform HTTP error body: `{"error": "...", "error_code": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_json_shape() {
        let frame = HubFrame::Command {
            id: "cmd_1".into(),
            command: "add_peer".into(),
            payload: serde_json::json!({"public_key": "K1", "allowed_ips": "10.0.0.2/32"}),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["id"], "cmd_1");
        assert_eq!(value["command"], "add_peer");
    }

    #[test]
    fn response_accepts_command_id_alias() {
        let raw = r#"{"type":"command_result","command_id":"cmd_7","success":true,"data":{"status":"added"}}"#;
        match serde_json::from_str::<HubFrame>(raw).unwrap() {
            HubFrame::CommandResult { id, success, data, .. } => {
                assert_eq!(id, "cmd_7");
                assert!(success);
                assert_eq!(data.unwrap()["status"], "added");
            }
            other => panic!("expected command_result, got {other:?}"),
        }
    }

    #[test]
    fn agent_frame_tags_are_snake_case() {
        let frame = AgentFrame::ConfigUpdated { timestamp: Utc::now() };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "config_updated");

        let ack: AgentFrame = serde_json::from_str(r#"{"type":"heartbeat_ack"}"#).unwrap();
        match ack {
            AgentFrame::HeartbeatAck { config_changed } => assert!(!config_changed),
            other => panic!("expected heartbeat_ack, got {other:?}"),
        }
    }

    #[test]
    fn hub_command_round_trips() {
        for cmd in [
            HubCommand::AddPeer,
            HubCommand::RemovePeer,
            HubCommand::UpdatePeer,
            HubCommand::SyncPeers,
            HubCommand::GetPeers,
            HubCommand::GetStatus,
            HubCommand::GetPeerStats,
            HubCommand::RestartInterface,
            HubCommand::Ping,
        ] {
            assert_eq!(HubCommand::parse(cmd.as_str()), Some(cmd));
        }
        assert_eq!(HubCommand::parse("flush_peers"), None);
    }

    #[test]
    fn wire_rule_omits_empty_fields() {
        let rule = WireAclRule {
            src_ip: Some("10.0.0.2/32".into()),
            dst_ip: None,
            protocol: Protocol::Tcp,
            port: Some(5432),
            action: RuleAction::Allow,
            description: None,
        };
        let value = serde_json::to_value(&rule).unwrap();
        assert!(value.get("dst_ip").is_none());
        assert_eq!(value["protocol"], "tcp");
        assert_eq!(value["action"], "allow");
    }
}
