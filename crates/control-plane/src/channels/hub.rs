//! The hub command channel.
//!
//! One hub agent at a time holds a bidirectional framed channel to the
//! control plane. Outbound commands carry a monotonically increasing
//! `cmd_<n>` id; a pending map of oneshot slots correlates responses.
//! A newer connection supersedes the older one, which is closed with
//! code 1000 and whose in-flight commands fail with a connection error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use nw_domain::{Error, Result};
use nw_protocol::{HubCommand, HubFrame, PeerSpec, SyncResult};

/// Consecutive failed connect attempts before a security alert.
const AUTH_FAILURE_ALERT_THRESHOLD: u32 = 3;

/// What the hub answered for one command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
}

struct HubConn {
    sink: mpsc::Sender<HubFrame>,
    epoch: u64,
    closer: CancellationToken,
    connected_at: DateTime<Utc>,
    last_ping: DateTime<Utc>,
    status: Value,
}

/// Connection info surfaced to the admin API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HubInfo {
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_ping: Option<DateTime<Utc>>,
    pub status: Value,
    pub pending_commands: usize,
}

/// The control-plane side of the hub channel.
pub struct HubChannel {
    conn: Mutex<Option<HubConn>>,
    pending: Mutex<HashMap<String, oneshot::Sender<CommandOutcome>>>,
    counter: AtomicU64,
    epoch_counter: AtomicU64,
    auth_failures: AtomicU32,
    default_timeout: Duration,
    ping_interval: Duration,
}

impl HubChannel {
    pub fn new(ping_interval: Duration) -> Self {
        HubChannel {
            conn: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            epoch_counter: AtomicU64::new(0),
            auth_failures: AtomicU32::new(0),
            default_timeout: Duration::from_secs(30),
            ping_interval,
        }
    }

    /// Inbound traffic must arrive at least this often or the channel
    /// is considered dead.
    pub fn idle_timeout(&self) -> Duration {
        self.ping_interval * 2
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().is_some()
    }

    pub fn info(&self) -> HubInfo {
        let conn = self.conn.lock();
        match conn.as_ref() {
            Some(c) => HubInfo {
                connected: true,
                connected_at: Some(c.connected_at),
                last_ping: Some(c.last_ping),
                status: c.status.clone(),
                pending_commands: self.pending.lock().len(),
            },
            None => HubInfo {
                connected: false,
                connected_at: None,
                last_ping: None,
                status: Value::Null,
                pending_commands: self.pending.lock().len(),
            },
        }
    }

    /// Register a new hub connection, superseding any existing one.
    ///
    /// Returns the connection epoch and its cancellation token; the WS
    /// handler watches the token and closes the socket with code 1000
    /// when a newer connect cancels it.
    pub fn attach(&self, sink: mpsc::Sender<HubFrame>) -> (u64, CancellationToken) {
        let epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let closer = CancellationToken::new();
        let now = Utc::now();

        let old = self.conn.lock().replace(HubConn {
            sink,
            epoch,
            closer: closer.clone(),
            connected_at: now,
            last_ping: now,
            status: Value::Null,
        });

        if let Some(old) = old {
            tracing::info!(old_epoch = old.epoch, "replacing existing hub agent connection");
            old.closer.cancel();
            self.fail_pending("hub agent superseded by a new connection");
        }

        self.auth_failures.store(0, Ordering::SeqCst);
        tracing::info!(epoch, "hub agent connected");
        (epoch, closer)
    }

    /// Drop the connection identified by `epoch`. A stale epoch (the
    /// connection was already superseded) is a no-op.
    pub fn detach(&self, epoch: u64) {
        let mut conn = self.conn.lock();
        if conn.as_ref().map(|c| c.epoch) == Some(epoch) {
            *conn = None;
            drop(conn);
            tracing::info!(epoch, "hub agent disconnected");
            self.fail_pending("hub agent disconnected");
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(CommandOutcome {
                success: false,
                data: Value::Null,
                error: Some(reason.to_string()),
            });
        }
        if count > 0 {
            tracing::warn!(failed = count, reason, "failed in-flight hub commands");
        }
    }

    /// Record an authentication failure on the hub endpoint. Returns
    /// true when the failure streak warrants a security alert.
    pub fn note_auth_failure(&self) -> bool {
        let failures = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
        failures == AUTH_FAILURE_ALERT_THRESHOLD
    }

    /// Refresh keepalive bookkeeping on any inbound traffic.
    pub fn touch(&self) {
        if let Some(conn) = self.conn.lock().as_mut() {
            conn.last_ping = Utc::now();
        }
    }

    /// Update the cached hub status (from `hello` and `status` frames).
    pub fn update_status(&self, status: Value) {
        if let Some(conn) = self.conn.lock().as_mut() {
            conn.status = status;
            conn.last_ping = Utc::now();
        }
    }

    /// Complete a pending command slot from an inbound response frame.
    /// Returns false for an unknown (e.g. timed out) command id.
    pub fn complete(&self, id: &str, success: bool, data: Option<Value>, error: Option<String>) -> bool {
        match self.pending.lock().remove(id) {
            Some(tx) => {
                let _ = tx.send(CommandOutcome {
                    success,
                    data: data.unwrap_or(Value::Null),
                    error,
                });
                true
            }
            None => {
                tracing::warn!(command_id = %id, "response for unknown command");
                false
            }
        }
    }

    /// Send a command and wait for its response.
    ///
    /// Errors: [`Error::Disconnected`] when no hub is attached (or it
    /// drops mid-flight), [`Error::Timeout`] past the deadline; the
    /// pending slot is cleared in both cases.
    pub async fn send_command(
        &self,
        command: HubCommand,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome> {
        let sink = self
            .conn
            .lock()
            .as_ref()
            .map(|c| c.sink.clone())
            .ok_or_else(|| Error::Disconnected("hub agent not connected".into()))?;

        let id = format!("cmd_{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let frame = HubFrame::Command {
            id: id.clone(),
            command: command.as_str().to_string(),
            payload,
            timestamp: Utc::now(),
        };
        if sink.send(frame).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::Disconnected("hub channel closed while sending".into()));
        }
        tracing::debug!(command_id = %id, command = command.as_str(), "sent hub command");

        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::Disconnected("hub agent disconnected".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Timeout(format!(
                    "command {} timed out after {}s",
                    command.as_str(),
                    timeout.as_secs()
                )))
            }
        }
    }

    fn expect_success(outcome: CommandOutcome) -> Result<Value> {
        if outcome.success {
            Ok(outcome.data)
        } else {
            Err(Error::Http(format!(
                "hub rejected command: {}",
                outcome.error.unwrap_or_else(|| "unknown error".into())
            )))
        }
    }

    // ── High-level commands ──────────────────────────────────────────

    pub async fn add_peer(&self, public_key: &str, allowed_ips: &str) -> Result<Value> {
        let outcome = self
            .send_command(
                HubCommand::AddPeer,
                json!({
                    "public_key": public_key,
                    "allowed_ips": allowed_ips,
                    "persistent_keepalive": 25,
                }),
                None,
            )
            .await?;
        Self::expect_success(outcome)
    }

    pub async fn remove_peer(&self, public_key: &str) -> Result<Value> {
        let outcome = self
            .send_command(HubCommand::RemovePeer, json!({"public_key": public_key}), None)
            .await?;
        Self::expect_success(outcome)
    }

    pub async fn update_peer(&self, public_key: &str, allowed_ips: Option<&str>) -> Result<Value> {
        let mut payload = json!({"public_key": public_key});
        if let Some(ips) = allowed_ips {
            payload["allowed_ips"] = json!(ips);
        }
        let outcome = self.send_command(HubCommand::UpdatePeer, payload, None).await?;
        Self::expect_success(outcome)
    }

    /// Authoritative replacement of the hub's peer table.
    pub async fn sync_peers(&self, peers: &[PeerSpec]) -> Result<SyncResult> {
        let outcome = self
            .send_command(HubCommand::SyncPeers, json!({"peers": peers}), None)
            .await?;
        let data = Self::expect_success(outcome)?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn get_status(&self) -> Result<Value> {
        Self::expect_success(self.send_command(HubCommand::GetStatus, json!({}), None).await?)
    }

    pub async fn get_peers(&self) -> Result<Value> {
        Self::expect_success(self.send_command(HubCommand::GetPeers, json!({}), None).await?)
    }

    pub async fn get_peer_stats(&self) -> Result<Value> {
        Self::expect_success(
            self.send_command(HubCommand::GetPeerStats, json!({}), None).await?,
        )
    }

    pub async fn restart_interface(&self) -> Result<Value> {
        Self::expect_success(
            self.send_command(HubCommand::RestartInterface, json!({}), None).await?,
        )
    }

    pub async fn ping(&self) -> Result<Value> {
        Self::expect_success(self.send_command(HubCommand::Ping, json!({}), None).await?)
    }
}
