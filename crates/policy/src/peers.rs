//! Hub peer-set compilation.
//!
//! The authoritative peer set is exactly the active nodes, each as a
//! `(public_key, overlay_ip/32)` pair. Suspended and revoked nodes are
//! omitted; the periodic hub sync converges the interface to this list.

use nw_protocol::PeerSpec;
use nw_registry::RegistrySnapshot;

/// Compile the hub peer set, ordered by node id for determinism.
pub fn compile_peer_set(snapshot: &RegistrySnapshot) -> Vec<PeerSpec> {
    let mut active: Vec<_> = snapshot.active_nodes().collect();
    active.sort_by_key(|n| n.id);
    active
        .into_iter()
        .map(|n| PeerSpec::new(n.public_key.clone(), format!("{}/32", n.overlay_ip)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nw_domain::model::{Node, NodeRole, NodeStatus};

    fn node(id: u64, key: &str, last_octet: u8, status: NodeStatus) -> Node {
        Node {
            id,
            hostname: format!("n{id}"),
            public_key: key.into(),
            overlay_ip: std::net::Ipv4Addr::new(10, 0, 0, last_octet),
            real_ip: None,
            role: NodeRole::App,
            status,
            agent_hash: None,
            last_reported_hash: None,
            hash_verified: false,
            hash_mismatch_count: 0,
            agent_version: None,
            os_info: None,
            last_seen: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn only_active_nodes_become_peers() {
        let snap = RegistrySnapshot {
            nodes: vec![
                node(1, "K1", 2, NodeStatus::Active),
                node(2, "K2", 3, NodeStatus::Suspended),
                node(3, "K3", 4, NodeStatus::Active),
                node(4, "K4", 5, NodeStatus::Revoked),
                node(5, "K5", 6, NodeStatus::Pending),
            ],
            users: vec![],
            groups: vec![],
            memberships: vec![],
            policies: vec![],
            acl_policies: vec![],
            config_version: 1,
        };

        let peers = compile_peer_set(&snap);
        assert_eq!(
            peers,
            vec![
                PeerSpec::new("K1", "10.0.0.2/32"),
                PeerSpec::new("K3", "10.0.0.4/32"),
            ]
        );
    }
}
