//! High-level peer management for the hub interface.
//!
//! Tracks a local cache of configured peers and computes the
//! add/remove/update/unchanged diff when the control plane pushes an
//! authoritative `sync_peers` list.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use nw_domain::Result;
use nw_protocol::{PeerSpec, SyncResult};

use crate::executor::TunnelExecutor;

pub struct PeerManager {
    tunnel: Arc<dyn TunnelExecutor>,
    cache: Mutex<HashMap<String, PeerSpec>>,
}

impl PeerManager {
    pub fn new(tunnel: Arc<dyn TunnelExecutor>) -> Self {
        PeerManager { tunnel, cache: Mutex::new(HashMap::new()) }
    }

    /// Add a peer; an already-known key turns into an update.
    pub async fn add_peer(&self, peer: PeerSpec) -> Result<()> {
        let exists = self.cache.lock().contains_key(&peer.public_key);
        if exists {
            tracing::warn!(public_key = %truncate(&peer.public_key), "peer already exists, updating");
            return self.update_peer(&peer.public_key, Some(&peer.allowed_ips)).await;
        }
        self.tunnel.add_peer(&peer).await?;
        tracing::info!(
            public_key = %truncate(&peer.public_key),
            allowed_ips = %peer.allowed_ips,
            "peer added"
        );
        self.cache.lock().insert(peer.public_key.clone(), peer);
        Ok(())
    }

    pub async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.tunnel.remove_peer(public_key).await?;
        self.cache.lock().remove(public_key);
        tracing::info!(public_key = %truncate(public_key), "peer removed");
        Ok(())
    }

    /// Re-add with new allowed IPs; the tunnel interface has no
    /// separate update operation.
    pub async fn update_peer(&self, public_key: &str, allowed_ips: Option<&str>) -> Result<()> {
        let Some(allowed_ips) = allowed_ips else {
            return Ok(()); // nothing to change
        };
        let peer = {
            let cache = self.cache.lock();
            let mut peer = cache
                .get(public_key)
                .cloned()
                .unwrap_or_else(|| PeerSpec::new(public_key, allowed_ips));
            peer.allowed_ips = allowed_ips.to_string();
            peer
        };
        self.tunnel.add_peer(&peer).await?;
        self.cache.lock().insert(public_key.to_string(), peer);
        Ok(())
    }

    /// Converge the interface to `desired`: remove stale peers, add
    /// missing ones, update changed allowed-IPs. Individual failures
    /// are collected rather than aborting the sync.
    pub async fn sync_peers(&self, desired: Vec<PeerSpec>) -> Result<SyncResult> {
        let current: HashMap<String, PeerSpec> = self
            .tunnel
            .current_peers()
            .await?
            .into_iter()
            .map(|p| (p.public_key.clone(), p))
            .collect();
        let desired_map: HashMap<String, PeerSpec> = desired
            .iter()
            .map(|p| (p.public_key.clone(), p.clone()))
            .collect();

        let mut result = SyncResult { total: desired_map.len(), ..Default::default() };

        for key in current.keys() {
            if !desired_map.contains_key(key) {
                match self.tunnel.remove_peer(key).await {
                    Ok(()) => {
                        result.removed += 1;
                        tracing::info!(public_key = %truncate(key), "removed stale peer");
                    }
                    Err(e) => result.errors.push(format!("remove {}: {e}", truncate(key))),
                }
            }
        }

        for (key, peer) in &desired_map {
            match current.get(key) {
                None => match self.tunnel.add_peer(peer).await {
                    Ok(()) => result.added += 1,
                    Err(e) => result.errors.push(format!("add {}: {e}", truncate(key))),
                },
                Some(existing) if existing.allowed_ips != peer.allowed_ips => {
                    match self.tunnel.add_peer(peer).await {
                        Ok(()) => result.updated += 1,
                        Err(e) => result.errors.push(format!("update {}: {e}", truncate(key))),
                    }
                }
                Some(_) => result.unchanged += 1,
            }
        }

        *self.cache.lock() = desired_map;
        Ok(result)
    }

    pub async fn peer_count(&self) -> Result<usize> {
        Ok(self.tunnel.current_peers().await?.len())
    }
}

fn truncate(key: &str) -> String {
    key.chars().take(16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InMemoryTunnel;

    async fn manager_with_peers(peers: &[(&str, &str)]) -> (Arc<InMemoryTunnel>, PeerManager) {
        let tunnel = Arc::new(InMemoryTunnel::new("wg0"));
        for (key, ips) in peers {
            tunnel.add_peer(&PeerSpec::new(*key, *ips)).await.unwrap();
        }
        let manager = PeerManager::new(tunnel.clone());
        (tunnel, manager)
    }

    #[tokio::test]
    async fn sync_converges_to_registry_truth() {
        // Hub still has K2, which was revoked while the channel was
        // offline; the authoritative list carries K1 and K3 only.
        let (tunnel, manager) = manager_with_peers(&[
            ("K1", "10.0.0.2/32"),
            ("K2", "10.0.0.3/32"),
            ("K3", "10.0.0.4/32"),
        ])
        .await;

        let result = manager
            .sync_peers(vec![
                PeerSpec::new("K1", "10.0.0.2/32"),
                PeerSpec::new("K3", "10.0.0.4/32"),
            ])
            .await
            .unwrap();

        assert_eq!(result.added, 0);
        assert_eq!(result.removed, 1);
        assert_eq!(result.updated, 0);
        assert_eq!(result.unchanged, 2);
        assert!(result.errors.is_empty());

        let keys: Vec<String> = tunnel
            .current_peers()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.public_key)
            .collect();
        assert_eq!(keys, vec!["K1", "K3"]);
    }

    #[tokio::test]
    async fn sync_adds_missing_and_updates_changed() {
        let (tunnel, manager) = manager_with_peers(&[("K1", "10.0.0.2/32")]).await;

        let result = manager
            .sync_peers(vec![
                PeerSpec::new("K1", "10.0.0.9/32"), // changed allowed_ips
                PeerSpec::new("K2", "10.0.0.3/32"), // new
            ])
            .await
            .unwrap();

        assert_eq!(result.added, 1);
        assert_eq!(result.updated, 1);
        assert_eq!(result.removed, 0);
        assert_eq!(result.unchanged, 0);

        let peers = tunnel.current_peers().await.unwrap();
        let k1 = peers.iter().find(|p| p.public_key == "K1").unwrap();
        assert_eq!(k1.allowed_ips, "10.0.0.9/32");
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let (_, manager) = manager_with_peers(&[]).await;
        let desired = vec![PeerSpec::new("K1", "10.0.0.2/32")];

        let first = manager.sync_peers(desired.clone()).await.unwrap();
        assert_eq!(first.added, 1);

        let second = manager.sync_peers(desired).await.unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.unchanged, 1);
    }

    #[tokio::test]
    async fn add_existing_peer_becomes_update() {
        let (tunnel, manager) = manager_with_peers(&[]).await;
        manager.add_peer(PeerSpec::new("K1", "10.0.0.2/32")).await.unwrap();
        manager.add_peer(PeerSpec::new("K1", "10.0.0.5/32")).await.unwrap();

        let peers = tunnel.current_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].allowed_ips, "10.0.0.5/32");
    }
}
