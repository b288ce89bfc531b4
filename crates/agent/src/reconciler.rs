//! The node agent's reconciliation loop.
//!
//! Register once, wait for approval, then keep local state converged:
//! on a push invalidation or the polling interval, fetch the canonical
//! config and apply it if (and only if) its version strictly increased.
//! Peers are applied before ACLs so a rule never references a tunnel
//! route that is not yet installed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nw_domain::model::{NodeRole, NodeStatus};
use nw_domain::{Error, Result};
use nw_protocol::{AgentConfig, HeartbeatRequest, RegisterRequest, RegisterResponse};

use crate::client::ControlPlaneClient;
use crate::executor::{FirewallExecutor, TunnelExecutor};
use crate::integrity::IntegrityCollector;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub hostname: String,
    pub role: NodeRole,
    pub agent_version: String,
    /// Polling fallback interval for config fetches.
    pub sync_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How often to re-check while waiting for admin approval.
    pub approval_poll_interval: Duration,
}

impl ReconcilerConfig {
    pub fn new(hostname: impl Into<String>, role: NodeRole) -> Self {
        ReconcilerConfig {
            hostname: hostname.into(),
            role,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            sync_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            approval_poll_interval: Duration::from_secs(10),
        }
    }
}

pub struct Reconciler {
    client: ControlPlaneClient,
    tunnel: Arc<dyn TunnelExecutor>,
    firewall: Arc<dyn FirewallExecutor>,
    /// `None` disables integrity self-reporting.
    collector: Option<IntegrityCollector>,
    config: ReconcilerConfig,
    public_key: Mutex<Option<String>>,
    status: Mutex<NodeStatus>,
    last_applied_version: AtomicU64,
}

impl Reconciler {
    pub fn new(
        client: ControlPlaneClient,
        tunnel: Arc<dyn TunnelExecutor>,
        firewall: Arc<dyn FirewallExecutor>,
        collector: Option<IntegrityCollector>,
        config: ReconcilerConfig,
    ) -> Self {
        Reconciler {
            client,
            tunnel,
            firewall,
            collector,
            config,
            public_key: Mutex::new(None),
            status: Mutex::new(NodeStatus::Pending),
            last_applied_version: AtomicU64::new(0),
        }
    }

    pub fn public_key(&self) -> Option<String> {
        self.public_key.lock().clone()
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock()
    }

    pub fn last_applied_version(&self) -> u64 {
        self.last_applied_version.load(Ordering::SeqCst)
    }

    /// First-run bootstrap: ensure a tunnel identity exists, then
    /// register. Registration is idempotent upstream, so re-running on
    /// restart is safe.
    pub async fn register(&self) -> Result<RegisterResponse> {
        let public_key = self.tunnel.ensure_keypair().await?;
        *self.public_key.lock() = Some(public_key.clone());

        let host = metrics::collect();
        let response = self
            .client
            .register(&RegisterRequest {
                hostname: self.config.hostname.clone(),
                role: self.config.role,
                public_key,
                os_info: host.os_info,
                agent_version: Some(self.config.agent_version.clone()),
            })
            .await?;

        *self.status.lock() = response.status;
        tracing::info!(
            node_id = response.node_id,
            overlay_ip = %response.overlay_ip,
            status = %response.status,
            "registered with control plane"
        );
        Ok(response)
    }

    /// Poll the config endpoint until the node is approved (the 403
    /// clears) or shutdown. Applies the first config on success.
    pub async fn wait_for_approval(&self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Err(Error::Disconnected("shutdown during approval wait".into()));
            }
            match self.client.get_config(&self.config.hostname).await {
                Ok(config) => {
                    tracing::info!("node is active, applying initial config");
                    self.apply_config(&config).await?;
                    return Ok(());
                }
                Err(Error::Unauthorized(_)) => {
                    tracing::info!("node pending approval, waiting");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.approval_poll_interval) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "approval check failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.approval_poll_interval * 3) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Apply a fetched config.
    ///
    /// Returns `Ok(false)` without touching the executors when the
    /// config's version is not strictly newer than the last applied
    /// one; the version is the ordering oracle and stale or duplicate
    /// deliveries are silently ignored.
    pub async fn apply_config(&self, config: &AgentConfig) -> Result<bool> {
        let last = self.last_applied_version.load(Ordering::SeqCst);
        if config.config_version <= last {
            tracing::debug!(
                version = config.config_version,
                last_applied = last,
                "ignoring stale config"
            );
            return Ok(false);
        }

        // Peers first, then ACLs.
        self.tunnel.apply_peers(&config.peers).await?;
        self.firewall.apply_rules(&config.acl_rules).await?;

        self.last_applied_version
            .store(config.config_version, Ordering::SeqCst);
        *self.status.lock() = config.status;

        tracing::info!(
            version = config.config_version,
            peers = config.peers.len(),
            acl_rules = config.acl_rules.len(),
            "config applied"
        );
        Ok(true)
    }

    /// Fetch the canonical config and apply it. Returns whether
    /// anything changed.
    pub async fn sync_once(&self) -> Result<bool> {
        let config = self.client.get_config(&self.config.hostname).await?;
        self.apply_config(&config).await
    }

    /// Send one heartbeat. Returns whether the control plane says a
    /// newer config exists.
    pub async fn heartbeat_once(&self) -> Result<bool> {
        let public_key = self
            .public_key
            .lock()
            .clone()
            .ok_or_else(|| Error::Invalid("heartbeat before registration".into()))?;

        let agent_hash = self.collector.as_ref().map(|c| c.report().combined_hash);
        let response = self
            .client
            .heartbeat(&HeartbeatRequest {
                hostname: self.config.hostname.clone(),
                public_key,
                metrics: Some(metrics::collect()),
                agent_hash,
                config_version: Some(self.last_applied_version()),
            })
            .await?;
        Ok(response.config_changed)
    }

    /// The agent main loop: register, wait for approval, then converge
    /// on push events and timers until shutdown.
    pub async fn run(
        &self,
        mut push_events: mpsc::Receiver<crate::push::PushEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.register().await?;
        self.wait_for_approval(&shutdown).await?;

        let mut sync_tick = tokio::time::interval(self.config.sync_interval);
        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_interval);
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Both fire immediately; the initial apply already happened.
        sync_tick.tick().await;
        heartbeat_tick.tick().await;

        loop {
            tokio::select! {
                event = push_events.recv() => {
                    match event {
                        Some(crate::push::PushEvent::ConfigUpdated) => {
                            if let Err(e) = self.sync_once().await {
                                tracing::warn!(error = %e, "sync after invalidation failed");
                            }
                        }
                        Some(crate::push::PushEvent::StatusChanged(status)) => {
                            *self.status.lock() = status;
                            if status != NodeStatus::Active {
                                tracing::warn!(status = %status, "node is no longer active");
                            }
                        }
                        Some(crate::push::PushEvent::Connected) => {
                            // Whatever happened while offline is caught
                            // up with one fetch.
                            if let Err(e) = self.sync_once().await {
                                tracing::debug!(error = %e, "post-connect sync failed");
                            }
                        }
                        Some(crate::push::PushEvent::Disconnected) => {
                            tracing::debug!("push channel lost, polling covers the gap");
                        }
                        None => {
                            tracing::warn!("push event stream ended");
                        }
                    }
                }
                _ = sync_tick.tick() => {
                    if let Err(e) = self.sync_once().await {
                        tracing::warn!(error = %e, "periodic sync failed");
                    }
                }
                _ = heartbeat_tick.tick() => {
                    match self.heartbeat_once().await {
                        Ok(true) => {
                            tracing::info!("heartbeat says config changed, syncing");
                            if let Err(e) = self.sync_once().await {
                                tracing::warn!(error = %e, "sync after heartbeat failed");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("reconciler shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{InMemoryFirewall, InMemoryTunnel};
    use nw_domain::model::{Protocol, RuleAction};
    use nw_protocol::{PeerSpec, WireAclRule};

    fn reconciler_with(
        tunnel: Arc<InMemoryTunnel>,
        firewall: Arc<InMemoryFirewall>,
    ) -> Reconciler {
        Reconciler::new(
            ControlPlaneClient::new("http://localhost:8001").unwrap(),
            tunnel,
            firewall,
            None,
            ReconcilerConfig::new("app-01", NodeRole::App),
        )
    }

    fn config(version: u64) -> AgentConfig {
        AgentConfig {
            overlay_ip: "10.0.0.2".into(),
            hub_public_key: "HUB".into(),
            hub_endpoint: "hub.example.com:51820".into(),
            peers: vec![PeerSpec {
                public_key: "HUB".into(),
                allowed_ips: "10.0.0.0/24".into(),
                endpoint: Some("hub.example.com:51820".into()),
                persistent_keepalive: 25,
            }],
            acl_rules: vec![WireAclRule {
                src_ip: Some("10.0.0.3/32".into()),
                dst_ip: Some("10.0.0.2/32".into()),
                protocol: Protocol::Tcp,
                port: Some(5432),
                action: RuleAction::Allow,
                description: None,
            }],
            config_version: version,
            status: NodeStatus::Active,
        }
    }

    #[tokio::test]
    async fn config_is_applied_once_per_version() {
        let tunnel = Arc::new(InMemoryTunnel::new("wg0"));
        let firewall = Arc::new(InMemoryFirewall::new());
        let reconciler = reconciler_with(tunnel.clone(), firewall.clone());

        assert!(reconciler.apply_config(&config(5)).await.unwrap());
        let peers_after_first = tunnel.current_peers().await.unwrap();
        let rules_after_first = firewall.installed_rules();

        // Same version again: silently ignored, local state identical.
        assert!(!reconciler.apply_config(&config(5)).await.unwrap());
        assert_eq!(tunnel.apply_count(), 1);
        assert_eq!(firewall.apply_count(), 1);
        assert_eq!(tunnel.current_peers().await.unwrap(), peers_after_first);
        assert_eq!(firewall.installed_rules(), rules_after_first);
    }

    #[tokio::test]
    async fn older_versions_are_refused() {
        let tunnel = Arc::new(InMemoryTunnel::new("wg0"));
        let firewall = Arc::new(InMemoryFirewall::new());
        let reconciler = reconciler_with(tunnel.clone(), firewall.clone());

        assert!(reconciler.apply_config(&config(9)).await.unwrap());
        assert!(!reconciler.apply_config(&config(8)).await.unwrap());
        assert_eq!(reconciler.last_applied_version(), 9);
        assert_eq!(tunnel.apply_count(), 1);
    }

    #[tokio::test]
    async fn newer_version_reapplies() {
        let tunnel = Arc::new(InMemoryTunnel::new("wg0"));
        let firewall = Arc::new(InMemoryFirewall::new());
        let reconciler = reconciler_with(tunnel.clone(), firewall.clone());

        assert!(reconciler.apply_config(&config(1)).await.unwrap());
        assert!(reconciler.apply_config(&config(2)).await.unwrap());
        assert_eq!(reconciler.last_applied_version(), 2);
        assert_eq!(tunnel.apply_count(), 2);
        assert_eq!(reconciler.status(), NodeStatus::Active);
    }

    #[tokio::test]
    async fn heartbeat_requires_registration() {
        let tunnel = Arc::new(InMemoryTunnel::new("wg0"));
        let firewall = Arc::new(InMemoryFirewall::new());
        let reconciler = reconciler_with(tunnel, firewall);

        let err = reconciler.heartbeat_once().await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}
