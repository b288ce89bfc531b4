//! End-to-end scenarios wired through real state: registry, event bus,
//! handlers, channels. Only the sockets are replaced by in-process
//! channels.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use nw_control_plane::handlers::register_event_handlers;
use nw_control_plane::service;
use nw_control_plane::state::AppState;
use nw_domain::config::Config;
use nw_domain::model::{
    AuditSeverity, DstRole, NodeRole, NodeStatus, Protocol, RuleAction,
};
use nw_events::event_type;
use nw_protocol::{trailer, HubFrame};
use nw_registry::store::{NewAclPolicy, NewNode, Registry};

fn test_state(dir: &tempfile::TempDir) -> AppState {
    let config = Config {
        admin_secret: "secret".into(),
        hub_agent_api_key: "hub-key".into(),
        hub_public_key: "HUB".into(),
        hub_endpoint: "hub.example.com:51820".into(),
        state_path: dir.path().to_path_buf(),
        ..Config::default()
    };
    let registry = Registry::open(dir.path(), config.overlay_network, 10).unwrap();
    let state = AppState::new(Arc::new(config), Arc::new(registry));
    register_event_handlers(&state);
    state
}

fn new_node(hostname: &str, role: NodeRole, key: &str) -> NewNode {
    NewNode {
        hostname: hostname.into(),
        role,
        public_key: key.into(),
        os_info: None,
        agent_version: Some("1.0.0".into()),
    }
}

/// Attach a scripted hub: every command is recorded and answered with
/// `response_for(command)`.
fn attach_scripted_hub(
    state: &AppState,
    response_for: impl Fn(&str) -> Value + Send + 'static,
) -> Arc<Mutex<Vec<(String, Value)>>> {
    let (tx, mut rx) = mpsc::channel::<HubFrame>(64);
    state.hub.attach(tx);

    let hub = state.hub.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_task = seen.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let HubFrame::Command { id, command, payload, .. } = frame {
                seen_task.lock().push((command.clone(), payload));
                hub.complete(&id, true, Some(response_for(&command)), None);
            }
        }
    });
    seen
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: fresh registration, pending → active
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn fresh_registration_and_approval_flow() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let hub_commands = attach_scripted_hub(&state, |_| json!({"status": "ok"}));

    // Register against an empty registry.
    let outcome = state
        .registry
        .register_node(new_node("app-01", NodeRole::App, "K1"))
        .unwrap();
    state.publish_all(outcome.events).await;

    assert_eq!(outcome.node.id, 1);
    assert_eq!(outcome.node.overlay_ip.to_string(), "10.0.0.2");
    assert_eq!(outcome.node.status, NodeStatus::Pending);
    assert!(hub_commands.lock().is_empty(), "pending node must not reach the hub");

    // Approve: config_version 0 -> 1, NodeRegistered(active) emitted
    // exactly once, add_peer dispatched.
    let (node, events) = state.registry.approve_node(1, "alice").unwrap();
    let registered_active = events
        .iter()
        .filter(|e| {
            e.event_type == event_type::NODE_REGISTERED && e.payload["status"] == "active"
        })
        .count();
    assert_eq!(registered_active, 1);
    state.publish_all(events).await;

    assert_eq!(node.status, NodeStatus::Active);
    assert_eq!(state.registry.config_version(), 1);

    let commands = hub_commands.lock().clone();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].0, "add_peer");
    assert_eq!(commands[0].1["public_key"], "K1");
    assert_eq!(commands[0].1["allowed_ips"], "10.0.0.2/32");

    // The persisting handler stored the whole trail.
    let stored = state.registry.event_store().recent(None, 100).unwrap();
    assert!(stored
        .iter()
        .any(|e| e.event.event_type == event_type::NODE_REGISTERED));
    assert!(stored
        .iter()
        .any(|e| e.event.event_type == event_type::CONFIG_VERSION_BUMPED));
    assert!(stored.iter().any(|e| e.event.event_type == event_type::PEER_ADDED));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: ACL compilation for the DB node
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn acl_compilation_for_db_node() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let app = state
        .registry
        .register_node(new_node("app-01", NodeRole::App, "K1"))
        .unwrap()
        .node;
    let db = state
        .registry
        .register_node(new_node("db-01", NodeRole::Db, "K2"))
        .unwrap()
        .node;
    state.registry.approve_node(app.id, "admin").unwrap();
    state.registry.approve_node(db.id, "admin").unwrap();
    state
        .registry
        .create_acl_policy(
            NewAclPolicy {
                name: "app-to-db".into(),
                src_role: NodeRole::App,
                dst_role: DstRole::Role(NodeRole::Db),
                port: Some(5432),
                protocol: Protocol::Tcp,
                action: RuleAction::Allow,
                priority: 100,
                enabled: true,
            },
            "admin",
        )
        .unwrap();

    let db = state.registry.node(db.id).unwrap();
    let config = service::build_agent_config(&state, &db);

    // One node-specific rule followed by the three trailing rules.
    assert_eq!(config.acl_rules.len(), 4);
    let rule = &config.acl_rules[0];
    assert_eq!(rule.src_ip.as_deref(), Some("10.0.0.2/32"));
    assert_eq!(rule.dst_ip.as_deref(), Some("10.0.0.3/32"));
    assert_eq!(rule.protocol, Protocol::Tcp);
    assert_eq!(rule.port, Some(5432));
    assert_eq!(rule.action, RuleAction::Allow);

    assert_eq!(config.acl_rules[1].description.as_deref(), Some(trailer::ESTABLISHED));
    assert_eq!(config.acl_rules[2].description.as_deref(), Some(trailer::ICMP_ECHO));
    assert_eq!(config.acl_rules[3].description.as_deref(), Some(trailer::DEFAULT_DROP));

    // The hub peer travels with the config; version matches the
    // registry.
    assert_eq!(config.peers.len(), 1);
    assert_eq!(config.peers[0].public_key, "HUB");
    assert_eq!(config.config_version, state.registry.config_version());

    // Compilation is pure: same inputs, same output.
    let again = service::build_agent_config(&state, &db);
    assert_eq!(config.acl_rules, again.acl_rules);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: integrity escalation over three heartbeats
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn integrity_escalation_suspends_after_three_mismatches() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let node = state
        .registry
        .register_node(new_node("app-01", NodeRole::App, "K1"))
        .unwrap()
        .node;
    state.registry.approve_node(node.id, "admin").unwrap();

    let good: String = "a".repeat(64);
    let bad: String = "b".repeat(64);
    state
        .registry
        .set_agent_hash(node.id, Some(good), "admin")
        .unwrap();

    for expected_count in 1..=2u32 {
        let response = service::process_heartbeat(
            &state,
            "app-01",
            None,
            Some(bad.clone()),
            None,
            None,
        )
        .await
        .unwrap();
        assert!(response.success);
        let node = state.registry.node(1).unwrap();
        assert_eq!(node.hash_mismatch_count, expected_count);
        assert_eq!(node.status, NodeStatus::Active);
    }

    // Third mismatch: suspended, critical audit row, lifecycle event.
    service::process_heartbeat(&state, "app-01", None, Some(bad), None, None)
        .await
        .unwrap();

    let node = state.registry.node(1).unwrap();
    assert_eq!(node.hash_mismatch_count, 3);
    assert_eq!(node.status, NodeStatus::Suspended);
    assert!(!node.hash_verified);

    let audits = state.registry.audit_log().recent(100).unwrap();
    assert!(audits
        .iter()
        .any(|r| r.action == "INTEGRITY_MISMATCH" && r.severity == AuditSeverity::Critical));

    let stored = state.registry.event_store().recent(None, 100).unwrap();
    assert!(stored
        .iter()
        .any(|e| e.event.event_type == event_type::NODE_SUSPENDED));
    assert!(stored
        .iter()
        .any(|e| e.event.event_type == event_type::TRUST_PENALTY_APPLIED));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: hub reconnect convergence via sync_peers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn hub_sync_carries_registry_truth_after_revocation() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    for (hostname, key) in [("n1", "K1"), ("n2", "K2"), ("n3", "K3")] {
        let node = state
            .registry
            .register_node(new_node(hostname, NodeRole::App, key))
            .unwrap()
            .node;
        state.registry.approve_node(node.id, "admin").unwrap();
    }
    // K2 is revoked while the hub is offline; no remove_peer reaches it.
    state.registry.revoke_node(2, "admin").unwrap();

    let hub_commands = attach_scripted_hub(&state, |command| match command {
        "sync_peers" => json!({
            "added": 0, "removed": 1, "updated": 0, "unchanged": 2, "total": 2,
        }),
        _ => json!({"status": "ok"}),
    });

    let result = service::sync_hub_peers(&state).await.unwrap();
    assert_eq!(result.removed, 1);
    assert_eq!(result.unchanged, 2);

    // The authoritative list the hub saw: K1 and K3 only.
    let commands = hub_commands.lock().clone();
    let (command, payload) = &commands[0];
    assert_eq!(command, "sync_peers");
    let peers = payload["peers"].as_array().unwrap();
    let keys: Vec<&str> = peers.iter().map(|p| p["public_key"].as_str().unwrap()).collect();
    assert_eq!(keys, vec!["K1", "K3"]);
    assert_eq!(peers[0]["allowed_ips"], "10.0.0.2/32");
    assert_eq!(peers[1]["allowed_ips"], "10.0.0.4/32");

    // The diff was published for the audit trail.
    let stored = state.registry.event_store().recent(Some(event_type::PEERS_SYNCED), 10).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].event.payload["removed"], 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: policy change fan-out to every connected agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn policy_update_notifies_all_connected_agents() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let mut receivers = Vec::new();
    for i in 0..17 {
        let (tx, rx) = mpsc::channel(8);
        state.agents.register(&format!("node-{i:02}"), i, tx);
        receivers.push(rx);
    }

    let (policy, events) = state
        .registry
        .create_acl_policy(
            NewAclPolicy {
                name: "ops-ssh".into(),
                src_role: NodeRole::Ops,
                dst_role: DstRole::Any,
                port: Some(22),
                protocol: Protocol::Tcp,
                action: RuleAction::Allow,
                priority: 100,
                enabled: true,
            },
            "admin",
        )
        .unwrap();
    state.publish_all(events).await;
    let version_before = state.registry.config_version();

    // Drain the create broadcast first.
    for rx in &mut receivers {
        while rx.try_recv().is_ok() {}
    }

    let (_, events) = state
        .registry
        .update_acl_policy(
            policy.id,
            NewAclPolicy {
                name: "ops-ssh".into(),
                src_role: NodeRole::Ops,
                dst_role: DstRole::Any,
                port: Some(2222),
                protocol: Protocol::Tcp,
                action: RuleAction::Allow,
                priority: 100,
                enabled: true,
            },
            "admin",
        )
        .unwrap();
    state.publish_all(events).await;

    assert_eq!(state.registry.config_version(), version_before + 1);
    for rx in &mut receivers {
        assert!(
            matches!(rx.try_recv(), Ok(nw_protocol::AgentFrame::ConfigUpdated { .. })),
            "every connected agent gets the invalidation"
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: IP allocation under contention
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[test]
fn concurrent_registrations_never_share_an_address() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        Registry::open(dir.path(), "10.0.0.0/24".parse().unwrap(), 10).unwrap(),
    );

    // Addresses .2-.4 already in use.
    for (hostname, key) in [("a", "KA"), ("b", "KB"), ("c", "KC")] {
        registry.register_node(new_node(hostname, NodeRole::App, key)).unwrap();
    }

    let r1 = registry.clone();
    let t1 = std::thread::spawn(move || {
        r1.register_node(new_node("x", NodeRole::App, "KX")).unwrap().node
    });
    let r2 = registry.clone();
    let t2 = std::thread::spawn(move || {
        r2.register_node(new_node("y", NodeRole::App, "KY")).unwrap().node
    });

    let n1 = t1.join().unwrap();
    let n2 = t2.join().unwrap();

    let mut ips = vec![n1.overlay_ip.to_string(), n2.overlay_ip.to_string()];
    ips.sort();
    assert_eq!(ips, vec!["10.0.0.5", "10.0.0.6"]);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat version signalling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn heartbeat_reports_config_changed_only_when_behind() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let node = state
        .registry
        .register_node(new_node("app-01", NodeRole::App, "K1"))
        .unwrap()
        .node;
    state.registry.approve_node(node.id, "admin").unwrap();
    let current = state.registry.config_version();

    let behind = service::process_heartbeat(&state, "app-01", None, None, Some(current - 1), None)
        .await
        .unwrap();
    assert!(behind.config_changed);

    let caught_up = service::process_heartbeat(&state, "app-01", None, None, Some(current), None)
        .await
        .unwrap();
    assert!(!caught_up.config_changed);
}
