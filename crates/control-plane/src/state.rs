use std::sync::Arc;

use nw_domain::config::Config;
use nw_events::EventBus;
use nw_integrity::IntegrityVerifier;
use nw_registry::Registry;

use crate::channels::agents::AgentRegistry;
use crate::channels::hub::HubChannel;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, registry, event bus, verifier
/// - **Channels** — hub command channel, node push channels
/// - **Security (startup-computed)** — token digests for constant-time
///   comparison
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub bus: Arc<EventBus>,
    pub verifier: Arc<IntegrityVerifier>,

    // ── Channels ──────────────────────────────────────────────────────
    pub hub: Arc<HubChannel>,
    pub agents: Arc<AgentRegistry>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 of `ADMIN_SECRET` (read once at startup).
    pub admin_token_hash: Arc<Vec<u8>>,
    /// SHA-256 of `HUB_AGENT_API_KEY` (read once at startup).
    pub hub_api_key_hash: Arc<Vec<u8>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>) -> Self {
        use sha2::{Digest, Sha256};

        let admin_token_hash = Sha256::digest(config.admin_secret.as_bytes()).to_vec();
        let hub_api_key_hash = Sha256::digest(config.hub_agent_api_key.as_bytes()).to_vec();

        AppState {
            hub: Arc::new(HubChannel::new(config.ping_interval)),
            agents: Arc::new(AgentRegistry::new()),
            bus: Arc::new(EventBus::new()),
            verifier: Arc::new(IntegrityVerifier::default()),
            admin_token_hash: Arc::new(admin_token_hash),
            hub_api_key_hash: Arc::new(hub_api_key_hash),
            config,
            registry,
        }
    }

    /// Publish a batch of store-returned events, in order, awaiting
    /// each one. Called after the mutation has committed.
    pub async fn publish_all(&self, events: Vec<nw_events::Event>) {
        for event in events {
            self.bus.publish_async(event).await;
        }
    }
}
