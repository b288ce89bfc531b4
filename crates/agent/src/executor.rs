//! Executor seams between reconciliation logic and the host.
//!
//! The control plane treats agents as black-box command executors; on
//! the agent side that boundary is these two traits. The in-memory
//! implementations back the test suite and the dry-run mode of the
//! shipped binaries; a production build plugs kernel-backed
//! implementations in here without touching the reconciler.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use nw_domain::Result;
use nw_protocol::{PeerSpec, WireAclRule};

/// Tunnel interface operations.
#[async_trait]
pub trait TunnelExecutor: Send + Sync {
    /// Create the keypair if absent; returns the public key.
    async fn ensure_keypair(&self) -> Result<String>;

    /// Authoritative replacement of the peer table.
    async fn apply_peers(&self, peers: &[PeerSpec]) -> Result<()>;

    async fn current_peers(&self) -> Result<Vec<PeerSpec>>;

    async fn add_peer(&self, peer: &PeerSpec) -> Result<()>;

    async fn remove_peer(&self, public_key: &str) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    /// Interface facts for status frames (name, up/down, peer count).
    async fn interface_status(&self) -> Result<Value>;
}

/// Packet-filter operations.
#[async_trait]
pub trait FirewallExecutor: Send + Sync {
    /// Install the ordered rule list, replacing whatever was there.
    async fn apply_rules(&self, rules: &[WireAclRule]) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tunnel executor that tracks state in memory. The keypair can be
/// pinned to a file so the identity survives restarts in dry-run mode.
pub struct InMemoryTunnel {
    interface: String,
    keypair_file: Option<PathBuf>,
    public_key: Mutex<Option<String>>,
    peers: Mutex<BTreeMap<String, PeerSpec>>,
    apply_count: AtomicUsize,
    restart_count: AtomicUsize,
}

impl InMemoryTunnel {
    pub fn new(interface: impl Into<String>) -> Self {
        InMemoryTunnel {
            interface: interface.into(),
            keypair_file: None,
            public_key: Mutex::new(None),
            peers: Mutex::new(BTreeMap::new()),
            apply_count: AtomicUsize::new(0),
            restart_count: AtomicUsize::new(0),
        }
    }

    /// Persist the generated public key under `dir/public.key`.
    pub fn with_keypair_file(mut self, dir: &std::path::Path) -> Self {
        self.keypair_file = Some(dir.join("public.key"));
        self
    }

    /// Seed a fixed public key (tests).
    pub fn with_public_key(self, key: impl Into<String>) -> Self {
        *self.public_key.lock() = Some(key.into());
        self
    }

    /// How many times `apply_peers` ran.
    pub fn apply_count(&self) -> usize {
        self.apply_count.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> usize {
        self.restart_count.load(Ordering::SeqCst)
    }

    fn generate_key(&self) -> String {
        // Dry-run identity: stable enough to act as a unique key, not a
        // real curve point.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let digest = Sha256::digest(format!("{}:{nanos}", self.interface).as_bytes());
        format!("DRY{}=", &hex::encode(digest)[..40])
    }
}

#[async_trait]
impl TunnelExecutor for InMemoryTunnel {
    async fn ensure_keypair(&self) -> Result<String> {
        if let Some(key) = self.public_key.lock().clone() {
            return Ok(key);
        }
        if let Some(path) = &self.keypair_file {
            if path.exists() {
                let key = std::fs::read_to_string(path)?.trim().to_string();
                *self.public_key.lock() = Some(key.clone());
                return Ok(key);
            }
        }
        let key = self.generate_key();
        if let Some(path) = &self.keypair_file {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &key)?;
        }
        *self.public_key.lock() = Some(key.clone());
        Ok(key)
    }

    async fn apply_peers(&self, peers: &[PeerSpec]) -> Result<()> {
        let mut table = self.peers.lock();
        table.clear();
        for peer in peers {
            table.insert(peer.public_key.clone(), peer.clone());
        }
        self.apply_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(interface = %self.interface, peers = peers.len(), "applied peer table");
        Ok(())
    }

    async fn current_peers(&self) -> Result<Vec<PeerSpec>> {
        Ok(self.peers.lock().values().cloned().collect())
    }

    async fn add_peer(&self, peer: &PeerSpec) -> Result<()> {
        self.peers.lock().insert(peer.public_key.clone(), peer.clone());
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.peers.lock().remove(public_key);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.restart_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!(interface = %self.interface, "interface restarted (dry run)");
        Ok(())
    }

    async fn interface_status(&self) -> Result<Value> {
        Ok(json!({
            "interface": self.interface,
            "running": true,
            "peer_count": self.peers.lock().len(),
            "backend": "in-memory",
        }))
    }
}

/// Firewall executor that records the installed rule list.
#[derive(Default)]
pub struct InMemoryFirewall {
    rules: Mutex<Vec<WireAclRule>>,
    apply_count: AtomicUsize,
}

impl InMemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed_rules(&self) -> Vec<WireAclRule> {
        self.rules.lock().clone()
    }

    pub fn apply_count(&self) -> usize {
        self.apply_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FirewallExecutor for InMemoryFirewall {
    async fn apply_rules(&self, rules: &[WireAclRule]) -> Result<()> {
        *self.rules.lock() = rules.to_vec();
        self.apply_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(rules = rules.len(), "applied firewall rules");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keypair_is_created_once_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = InMemoryTunnel::new("wg0").with_keypair_file(dir.path());
        let key1 = tunnel.ensure_keypair().await.unwrap();
        let key2 = tunnel.ensure_keypair().await.unwrap();
        assert_eq!(key1, key2);

        // A fresh executor over the same dir reads the same identity.
        let tunnel2 = InMemoryTunnel::new("wg0").with_keypair_file(dir.path());
        assert_eq!(tunnel2.ensure_keypair().await.unwrap(), key1);
    }

    #[tokio::test]
    async fn apply_peers_is_authoritative() {
        let tunnel = InMemoryTunnel::new("wg0");
        tunnel
            .apply_peers(&[PeerSpec::new("K1", "10.0.0.2/32"), PeerSpec::new("K2", "10.0.0.3/32")])
            .await
            .unwrap();
        tunnel.apply_peers(&[PeerSpec::new("K3", "10.0.0.4/32")]).await.unwrap();

        let peers = tunnel.current_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, "K3");
        assert_eq!(tunnel.apply_count(), 2);
    }

    #[tokio::test]
    async fn firewall_records_ordered_rules() {
        let firewall = InMemoryFirewall::new();
        let rules = vec![WireAclRule {
            src_ip: Some("10.0.0.2/32".into()),
            dst_ip: None,
            protocol: nw_domain::model::Protocol::Tcp,
            port: Some(22),
            action: nw_domain::model::RuleAction::Allow,
            description: None,
        }];
        firewall.apply_rules(&rules).await.unwrap();
        assert_eq!(firewall.installed_rules(), rules);
        assert_eq!(firewall.apply_count(), 1);
    }
}
