//! Registry of connected node agents and the invalidation fan-out.
//!
//! One entry per hostname; a reconnect for the same hostname supersedes
//! the previous channel (closed with code 1000). The fan-out has no
//! queue: a failed send drops the connection on the spot and the
//! periodic hub/agent reconciliation covers whatever was missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nw_domain::model::NodeStatus;
use nw_protocol::AgentFrame;

pub type AgentSink = mpsc::Sender<AgentFrame>;

/// A connected node agent.
pub struct ConnectedAgent {
    pub hostname: String,
    pub node_id: u64,
    pub conn_id: u64,
    pub connected_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    /// Channel to the connection's WS writer task.
    pub sink: AgentSink,
    /// Cancelled when a newer connection supersedes this one.
    pub closer: CancellationToken,
}

/// Summary info returned by the admin listing.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub hostname: String,
    pub node_id: u64,
    pub connected_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
}

/// Thread-safe registry of all connected node agents.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, ConnectedAgent>>,
    conn_counter: AtomicU64,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        AgentRegistry {
            agents: RwLock::new(HashMap::new()),
            conn_counter: AtomicU64::new(0),
        }
    }

    /// Register a connection for `hostname`, superseding any existing
    /// one. Returns the connection id and the new closer token.
    pub fn register(
        &self,
        hostname: &str,
        node_id: u64,
        sink: AgentSink,
    ) -> (u64, CancellationToken) {
        let conn_id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let closer = CancellationToken::new();
        let now = Utc::now();

        let old = self.agents.write().insert(
            hostname.to_string(),
            ConnectedAgent {
                hostname: hostname.to_string(),
                node_id,
                conn_id,
                connected_at: now,
                last_ping: now,
                sink,
                closer: closer.clone(),
            },
        );
        if let Some(old) = old {
            tracing::info!(hostname = %hostname, "replacing existing agent connection");
            old.closer.cancel();
        }

        tracing::info!(
            hostname = %hostname,
            node_id,
            total = self.count(),
            "agent connected"
        );
        (conn_id, closer)
    }

    /// Remove `hostname`'s connection if it still is `conn_id`; a stale
    /// id (already superseded) is a no-op.
    pub fn remove(&self, hostname: &str, conn_id: u64) {
        let mut agents = self.agents.write();
        if agents.get(hostname).map(|a| a.conn_id) == Some(conn_id) {
            agents.remove(hostname);
            drop(agents);
            tracing::info!(hostname = %hostname, total = self.count(), "agent disconnected");
        }
    }

    /// Drop a connection regardless of which id holds it (send failure).
    fn evict(&self, hostname: &str) {
        if let Some(agent) = self.agents.write().remove(hostname) {
            agent.closer.cancel();
            tracing::warn!(hostname = %hostname, "agent connection dropped after send failure");
        }
    }

    pub fn touch(&self, hostname: &str) {
        if let Some(agent) = self.agents.write().get_mut(hostname) {
            agent.last_ping = Utc::now();
        }
    }

    pub fn count(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_connected(&self, hostname: &str) -> bool {
        self.agents.read().contains_key(hostname)
    }

    pub fn connected_hostnames(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        self.agents
            .read()
            .values()
            .map(|a| AgentInfo {
                hostname: a.hostname.clone(),
                node_id: a.node_id,
                connected_at: a.connected_at,
                last_ping: a.last_ping,
            })
            .collect()
    }

    fn sink_of(&self, hostname: &str) -> Option<AgentSink> {
        self.agents.read().get(hostname).map(|a| a.sink.clone())
    }

    /// Send one frame to one agent. A send failure drops the
    /// connection and returns false.
    pub async fn send_to(&self, hostname: &str, frame: AgentFrame) -> bool {
        let Some(sink) = self.sink_of(hostname) else {
            return false;
        };
        if sink.send(frame).await.is_err() {
            self.evict(hostname);
            return false;
        }
        true
    }

    /// Deliver a `config_updated` invalidation to the listed hostnames,
    /// or to every connected agent when `targets` is `None`. Returns
    /// the number of agents actually reached.
    pub async fn notify_config_update(&self, targets: Option<&[String]>) -> usize {
        let frame = AgentFrame::ConfigUpdated { timestamp: Utc::now() };

        let hostnames: Vec<String> = match targets {
            Some(list) => list.to_vec(),
            None => self.connected_hostnames(),
        };

        let mut delivered = 0;
        for hostname in hostnames {
            if self.send_to(&hostname, frame.clone()).await {
                delivered += 1;
            }
        }
        tracing::debug!(delivered, "config_updated fan-out complete");
        delivered
    }

    /// Tell one agent its lifecycle status changed.
    pub async fn send_status_changed(&self, hostname: &str, status: NodeStatus) -> bool {
        self.send_to(hostname, AgentFrame::StatusChanged { status }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(capacity: usize) -> (AgentSink, mpsc::Receiver<AgentFrame>) {
        mpsc::channel(capacity)
    }

    #[tokio::test]
    async fn register_and_notify_all() {
        let registry = AgentRegistry::new();
        let mut receivers = Vec::new();
        for i in 0..17 {
            let (tx, rx) = sink(4);
            registry.register(&format!("node-{i:02}"), i, tx);
            receivers.push(rx);
        }

        let delivered = registry.notify_config_update(None).await;
        assert_eq!(delivered, 17);
        for rx in &mut receivers {
            assert!(matches!(rx.recv().await, Some(AgentFrame::ConfigUpdated { .. })));
        }
    }

    #[tokio::test]
    async fn targeted_notify_counts_only_reached() {
        let registry = AgentRegistry::new();
        let (tx, mut rx) = sink(4);
        registry.register("app-01", 1, tx);

        let targets = vec!["app-01".to_string(), "ghost".to_string()];
        let delivered = registry.notify_config_update(Some(&targets)).await;
        assert_eq!(delivered, 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_failure_drops_connection() {
        let registry = AgentRegistry::new();
        let (tx, rx) = sink(1);
        registry.register("app-01", 1, tx);
        drop(rx); // the writer side is gone

        let ok = registry.send_to("app-01", AgentFrame::Pong { timestamp: None }).await;
        assert!(!ok);
        assert!(!registry.is_connected("app-01"));
    }

    #[tokio::test]
    async fn reconnect_supersedes_and_cancels_old() {
        let registry = AgentRegistry::new();
        let (tx1, _rx1) = sink(4);
        let (conn1, closer1) = registry.register("app-01", 1, tx1);

        let (tx2, mut rx2) = sink(4);
        let (conn2, _closer2) = registry.register("app-01", 1, tx2);

        assert!(closer1.is_cancelled());
        assert_eq!(registry.count(), 1);

        // The stale connection's cleanup must not evict the new one.
        registry.remove("app-01", conn1);
        assert!(registry.is_connected("app-01"));

        assert!(registry.send_status_changed("app-01", NodeStatus::Suspended).await);
        assert!(matches!(
            rx2.recv().await,
            Some(AgentFrame::StatusChanged { status: NodeStatus::Suspended })
        ));

        registry.remove("app-01", conn2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn touch_updates_last_ping() {
        let registry = AgentRegistry::new();
        let (tx, _rx) = sink(4);
        registry.register("app-01", 1, tx);
        let before = registry.list()[0].last_ping;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.touch("app-01");
        assert!(registry.list()[0].last_ping >= before);
    }
}
