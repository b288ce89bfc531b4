//! Control-plane configuration, assembled from the environment.
//!
//! The canonical variable names are inherited from the deployment
//! tooling: `DATABASE_URL` (registry state directory), `OVERLAY_NETWORK`,
//! `HUB_PUBLIC_KEY`, `HUB_ENDPOINT`, `ADMIN_SECRET`, `HUB_AGENT_API_KEY`.
//! `NW_*` variables tune listener address, DNS, and timer intervals.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the JSON registry files and append-only logs.
    pub state_path: PathBuf,
    /// The fixed overlay subnet. `.0`, `.1` (hub) and the broadcast
    /// address are never allocated.
    pub overlay_network: Ipv4Net,
    /// Tunnel identity of the hub, handed to agents at registration.
    pub hub_public_key: String,
    /// Publicly reachable tunnel endpoint of the hub (`host:port`).
    pub hub_endpoint: String,
    /// Shared secret for the `X-Admin-Token` header.
    pub admin_secret: String,
    /// Shared key the hub agent presents on its command channel.
    pub hub_agent_api_key: String,
    pub listen_addr: SocketAddr,
    /// DNS servers pushed to agents at registration.
    pub dns_servers: Vec<String>,
    /// Interval of the authoritative hub `sync_peers` reconciliation.
    pub sync_interval: Duration,
    /// Agent keepalive interval; channels die after twice this without
    /// inbound traffic.
    pub ping_interval: Duration,
    /// Remaining-address count that triggers an `IPPoolLow` event.
    pub ip_pool_low_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            state_path: PathBuf::from("./netwarden-state"),
            overlay_network: "10.0.0.0/24".parse().unwrap(),
            hub_public_key: String::new(),
            hub_endpoint: String::new(),
            admin_secret: String::new(),
            hub_agent_api_key: String::new(),
            listen_addr: "0.0.0.0:8001".parse().unwrap(),
            dns_servers: vec!["10.0.0.1".to_string()],
            sync_interval: Duration::from_secs(300),
            ping_interval: Duration::from_secs(30),
            ip_pool_low_threshold: 10,
        }
    }
}

impl Config {
    /// Assemble the configuration from environment variables, applying
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            // Accept a bare path or a file: URL.
            let path = url.strip_prefix("file:").unwrap_or(&url);
            config.state_path = PathBuf::from(path);
        }
        if let Ok(net) = std::env::var("OVERLAY_NETWORK") {
            config.overlay_network = net
                .parse()
                .map_err(|e| Error::Config(format!("OVERLAY_NETWORK \"{net}\": {e}")))?;
        }
        if let Ok(key) = std::env::var("HUB_PUBLIC_KEY") {
            config.hub_public_key = key;
        }
        if let Ok(endpoint) = std::env::var("HUB_ENDPOINT") {
            config.hub_endpoint = endpoint;
        }
        if let Ok(secret) = std::env::var("ADMIN_SECRET") {
            config.admin_secret = secret;
        }
        if let Ok(key) = std::env::var("HUB_AGENT_API_KEY") {
            config.hub_agent_api_key = key;
        }
        if let Ok(addr) = std::env::var("NW_LISTEN_ADDR") {
            config.listen_addr = addr
                .parse()
                .map_err(|e| Error::Config(format!("NW_LISTEN_ADDR \"{addr}\": {e}")))?;
        }
        if let Ok(dns) = std::env::var("NW_DNS_SERVERS") {
            config.dns_servers = dns
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(secs) = std::env::var("NW_SYNC_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| Error::Config(format!("NW_SYNC_INTERVAL_SECS: {e}")))?;
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("NW_PING_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| Error::Config(format!("NW_PING_INTERVAL_SECS: {e}")))?;
            config.ping_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good; the daemon
    /// refuses to start on any `Error`-severity issue.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.admin_secret.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "ADMIN_SECRET".into(),
                message: "admin secret must be set".into(),
            });
        }
        if self.hub_agent_api_key.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "HUB_AGENT_API_KEY".into(),
                message: "hub agent API key must be set".into(),
            });
        }
        if self.hub_public_key.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "HUB_PUBLIC_KEY".into(),
                message: "hub public key is empty; agents cannot build tunnel configs".into(),
            });
        }
        if self.hub_endpoint.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "HUB_ENDPOINT".into(),
                message: "hub endpoint is empty; agents cannot reach the hub".into(),
            });
        }
        if self.overlay_network.prefix_len() > 30 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "OVERLAY_NETWORK".into(),
                message: format!(
                    "/{} leaves no allocatable host addresses",
                    self.overlay_network.prefix_len()
                ),
            });
        } else if self.overlay_network.prefix_len() != 24 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "OVERLAY_NETWORK".into(),
                message: format!(
                    "expected a /24, got /{}",
                    self.overlay_network.prefix_len()
                ),
            });
        }
        if self.sync_interval.is_zero() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "NW_SYNC_INTERVAL_SECS".into(),
                message: "sync interval must be greater than 0".into(),
            });
        }
        if self.ping_interval.is_zero() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "NW_PING_INTERVAL_SECS".into(),
                message: "ping interval must be greater than 0".into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            admin_secret: "secret".into(),
            hub_agent_api_key: "hub-key".into(),
            hub_public_key: "HUBKEY".into(),
            hub_endpoint: "hub.example.com:51820".into(),
            ..Config::default()
        }
    }

    #[test]
    fn default_overlay_network_is_the_canonical_slash_24() {
        let config = Config::default();
        assert_eq!(config.overlay_network.to_string(), "10.0.0.0/24");
        assert_eq!(config.listen_addr.port(), 8001);
    }

    #[test]
    fn validate_passes_on_complete_config() {
        assert!(valid_config().validate().is_empty());
    }

    #[test]
    fn validate_rejects_missing_secrets() {
        let mut config = valid_config();
        config.admin_secret.clear();
        config.hub_agent_api_key.clear();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn validate_warns_on_odd_prefix_and_rejects_tiny_nets() {
        let mut config = valid_config();
        config.overlay_network = "10.0.0.0/25".parse().unwrap();
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning && i.field == "OVERLAY_NETWORK"));

        config.overlay_network = "10.0.0.0/31".parse().unwrap();
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "OVERLAY_NETWORK"));
    }
}
