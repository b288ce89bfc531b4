//! Event-handler wiring and the periodic hub reconciliation.
//!
//! Handlers are bound to the bus at startup, never at module load, so
//! tests can wire isolated instances. Hub peer calls made from here are
//! best-effort: a disconnected hub drops them and the periodic
//! registry-driven `sync_peers` converges the interface afterwards.

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use nw_domain::model::{AuditRecord, AuditSeverity, NodeStatus};
use nw_events::{event_type, Event, Priority};

use crate::service;
use crate::state::AppState;

/// Bind all control-plane handlers to the state's event bus.
pub fn register_event_handlers(state: &AppState) {
    register_persistence(state);
    register_hub_side_effects(state);
    register_agent_notifications(state);
    register_security_audit(state);

    tracing::info!(
        subscriptions = state.bus.subscription_counts().values().sum::<usize>(),
        "event handlers registered"
    );
}

/// HIGH-priority persistence: every published event lands in the event
/// store before anything else reacts to it.
fn register_persistence(state: &AppState) {
    let registry = state.registry.clone();
    for &event_type in event_type::all() {
        let registry = registry.clone();
        state.bus.subscribe(event_type, "event-store", Priority::High, move |event| {
            registry.event_store().append(event)?;
            Ok(())
        });
    }
}

/// Hub peer mutations driven by node lifecycle. Best-effort: failures
/// are logged, never retried; the periodic sync is the backstop.
fn register_hub_side_effects(state: &AppState) {
    // Activation (fresh approval re-announces `NodeRegistered` with
    // status=active; resume has its own type).
    for activation in [event_type::NODE_REGISTERED, event_type::NODE_RESUMED] {
        let hub = state.hub.clone();
        let bus = state.bus.clone();
        state.bus.subscribe_async_with(
            activation,
            "hub-add-peer",
            Priority::Normal,
            0,
            Duration::ZERO,
            move |event: Event| {
                let hub = hub.clone();
                let bus = bus.clone();
                async move {
                    if event.payload["status"] != "active" {
                        return Ok(());
                    }
                    let Some(public_key) = event.payload["public_key"].as_str() else {
                        return Ok(());
                    };
                    let Some(overlay_ip) = event.payload["overlay_ip"].as_str() else {
                        return Ok(());
                    };
                    let allowed_ips = format!("{overlay_ip}/32");
                    match hub.add_peer(public_key, &allowed_ips).await {
                        Ok(_) => {
                            bus.publish_async(Event::new(
                                event_type::PEER_ADDED,
                                json!({"public_key": public_key, "allowed_ips": allowed_ips}),
                            ))
                            .await;
                        }
                        Err(e) => {
                            tracing::debug!(
                                public_key = %public_key,
                                error = %e,
                                "best-effort add_peer skipped"
                            );
                        }
                    }
                    Ok(())
                }
            },
        );
    }

    for removal in [event_type::NODE_REVOKED, event_type::NODE_DELETED, event_type::NODE_SUSPENDED] {
        let hub = state.hub.clone();
        let bus = state.bus.clone();
        state.bus.subscribe_async_with(
            removal,
            "hub-remove-peer",
            Priority::Normal,
            0,
            Duration::ZERO,
            move |event: Event| {
                let hub = hub.clone();
                let bus = bus.clone();
                async move {
                    let Some(public_key) = event.payload["public_key"].as_str() else {
                        return Ok(());
                    };
                    match hub.remove_peer(public_key).await {
                        Ok(_) => {
                            bus.publish_async(Event::new(
                                event_type::PEER_REMOVED,
                                json!({"public_key": public_key}),
                            ))
                            .await;
                        }
                        Err(e) => {
                            tracing::debug!(
                                public_key = %public_key,
                                error = %e,
                                "best-effort remove_peer skipped"
                            );
                        }
                    }
                    Ok(())
                }
            },
        );
    }
}

/// Push-channel notifications: invalidations on version bumps and
/// targeted status frames on lifecycle transitions.
fn register_agent_notifications(state: &AppState) {
    let agents = state.agents.clone();
    state.bus.subscribe_async_with(
        event_type::CONFIG_VERSION_BUMPED,
        "notify-config-update",
        Priority::Normal,
        0,
        Duration::ZERO,
        move |event: Event| {
            let agents = agents.clone();
            async move {
                let delivered = agents.notify_config_update(None).await;
                tracing::debug!(
                    version = event.payload["version"].as_u64(),
                    delivered,
                    "config invalidation broadcast"
                );
                Ok(())
            }
        },
    );

    for (lifecycle, status) in [
        (event_type::NODE_REGISTERED, NodeStatus::Active),
        (event_type::NODE_RESUMED, NodeStatus::Active),
        (event_type::NODE_SUSPENDED, NodeStatus::Suspended),
        (event_type::NODE_REVOKED, NodeStatus::Revoked),
    ] {
        let agents = state.agents.clone();
        state.bus.subscribe_async_with(
            lifecycle,
            "notify-status-changed",
            Priority::Low,
            0,
            Duration::ZERO,
            move |event: Event| {
                let agents = agents.clone();
                async move {
                    // Activation frames only make sense for the
                    // re-announce payload carrying status=active.
                    if status == NodeStatus::Active && event.payload["status"] != "active" {
                        return Ok(());
                    }
                    if let Some(hostname) = event.payload["hostname"].as_str() {
                        agents.send_status_changed(hostname, status).await;
                    }
                    Ok(())
                }
            },
        );
    }
}

/// Security alerts land in the audit log with critical severity.
fn register_security_audit(state: &AppState) {
    let registry = state.registry.clone();
    state.bus.subscribe(
        event_type::SECURITY_ALERT,
        "security-audit",
        Priority::High,
        move |event| {
            let alert = event.payload["alert"].as_str().unwrap_or("unknown alert");
            registry.audit_log().append(
                &AuditRecord::system("SECURITY_ALERT", "system", "-", alert)
                    .with_severity(AuditSeverity::Critical),
            )?;
            Ok(())
        },
    );
}

/// Periodic registry-driven `sync_peers`: the authoritative backstop
/// for peer mutations dropped while the hub was offline.
pub fn spawn_hub_sync_loop(
    state: AppState,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = state.config.sync_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh start
        // does not race the hub's connect.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("hub sync loop stopping");
                    return;
                }
            }
            if !state.hub.is_connected() {
                tracing::debug!("hub not connected, skipping periodic sync");
                continue;
            }
            if let Err(e) = service::sync_hub_peers(&state).await {
                tracing::warn!(error = %e, "periodic hub sync failed");
            }
        }
    })
}

/// Register handlers and start background loops; returns the join
/// handle of the sync loop.
pub fn start(state: &AppState, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    register_event_handlers(state);
    spawn_hub_sync_loop(state.clone(), shutdown)
}

/// Publish the pool-exhaustion event; called by the registration path
/// when the allocator comes up empty.
pub async fn publish_pool_exhausted(state: &AppState) {
    state
        .bus
        .publish_async(
            Event::new(event_type::IP_POOL_EXHAUSTED, json!({"ip": null}))
                .with_source("ipam"),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use nw_domain::config::Config;
    use nw_registry::Registry;
    use std::sync::Arc;
    use tokio::sync::mpsc;

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
        AppState::new(Arc::new(config), Arc::new(registry))
    }

    #[tokio::test]
    async fn activation_event_dispatches_add_peer() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        register_event_handlers(&state);

        // Fake hub: record commands, answer success.
        let (tx, mut rx) = mpsc::channel(16);
        state.hub.attach(tx);
        let hub = state.hub.clone();
        let commands = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let commands_task = commands.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let nw_protocol::HubFrame::Command { id, command, payload, .. } = frame {
                    commands_task.lock().push((command, payload));
                    hub.complete(&id, true, Some(json!({"status": "ok"})), None);
                }
            }
        });

        state
            .bus
            .publish_async(Event::new(
                event_type::NODE_REGISTERED,
                json!({
                    "node_id": 1,
                    "hostname": "app-01",
                    "public_key": "K1",
                    "overlay_ip": "10.0.0.2",
                    "status": "active",
                }),
            ))
            .await;

        let seen = commands.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "add_peer");
        assert_eq!(seen[0].1["public_key"], "K1");
        assert_eq!(seen[0].1["allowed_ips"], "10.0.0.2/32");
    }

    #[tokio::test]
    async fn pending_registration_does_not_touch_hub() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        register_event_handlers(&state);

        let (tx, mut rx) = mpsc::channel(16);
        state.hub.attach(tx);

        state
            .bus
            .publish_async(Event::new(
                event_type::NODE_REGISTERED,
                json!({
                    "node_id": 1,
                    "hostname": "app-01",
                    "public_key": "K1",
                    "overlay_ip": "10.0.0.2",
                    "status": "pending",
                }),
            ))
            .await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn revocation_dispatches_remove_peer_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        register_event_handlers(&state);

        // No hub attached: the handler must swallow the failure.
        state
            .bus
            .publish_async(Event::new(
                event_type::NODE_REVOKED,
                json!({"node_id": 1, "hostname": "app-01", "public_key": "K1", "status": "revoked"}),
            ))
            .await;

        // Events were still persisted by the HIGH-priority handler.
        let stored = state.registry.event_store().recent(None, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event.event_type, event_type::NODE_REVOKED);
    }

    #[tokio::test]
    async fn version_bump_broadcasts_to_connected_agents() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        register_event_handlers(&state);

        let (tx, mut rx) = mpsc::channel(4);
        state.agents.register("app-01", 1, tx);

        state
            .bus
            .publish_async(Event::new(
                event_type::CONFIG_VERSION_BUMPED,
                json!({"version": 7}),
            ))
            .await;

        assert!(matches!(
            rx.recv().await,
            Some(nw_protocol::AgentFrame::ConfigUpdated { .. })
        ));
    }

    #[tokio::test]
    async fn suspension_pushes_status_changed() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        register_event_handlers(&state);

        let (tx, mut rx) = mpsc::channel(4);
        state.agents.register("app-01", 1, tx);

        state
            .bus
            .publish_async(Event::new(
                event_type::NODE_SUSPENDED,
                json!({"node_id": 1, "hostname": "app-01", "status": "suspended"}),
            ))
            .await;

        assert!(matches!(
            rx.recv().await,
            Some(nw_protocol::AgentFrame::StatusChanged { status: NodeStatus::Suspended })
        ));
    }

    #[tokio::test]
    async fn security_alert_lands_in_audit_log() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        register_event_handlers(&state);

        state
            .bus
            .publish_async(Event::new(
                event_type::SECURITY_ALERT,
                json!({"alert": "repeated hub auth failures"}),
            ))
            .await;

        let rows = state.registry.audit_log().recent(10).unwrap();
        assert!(rows
            .iter()
            .any(|r| r.action == "SECURITY_ALERT" && r.severity == AuditSeverity::Critical));
    }
}
