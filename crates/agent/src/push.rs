//! Push-channel client for node agents.
//!
//! Maintains the long-lived invalidation channel to the control plane:
//! reconnects with exponential backoff, pings every `ping_interval`,
//! and forwards `config_updated` / `status_changed` frames to the
//! reconciler. The channel carries no config payloads; on any doubt the
//! reconciler re-fetches over HTTP, so losing this connection degrades
//! to polling rather than to incorrectness.

use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use nw_domain::model::NodeStatus;
use nw_protocol::AgentFrame;

use crate::backoff::ReconnectBackoff;

/// Signals surfaced to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Connected,
    /// The canonical config changed; re-fetch it.
    ConfigUpdated,
    StatusChanged(NodeStatus),
    Disconnected,
}

pub struct PushChannelClient {
    ws_url: String,
    ping_interval: Duration,
    backoff: ReconnectBackoff,
}

impl PushChannelClient {
    pub fn new(
        base_url: &str,
        hostname: &str,
        public_key: &str,
        ping_interval: Duration,
    ) -> Self {
        let ws_base = ws_url_from_http(base_url);
        let ws_url = format!(
            "{ws_base}/api/v1/ws/agent/{hostname}?public_key={}",
            percent_encode(public_key)
        );
        PushChannelClient {
            ws_url,
            ping_interval,
            backoff: ReconnectBackoff::default(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Run the channel until shutdown. Reconnects forever; the backoff
    /// resets after every successful connect.
    pub async fn run(self, events: mpsc::Sender<PushEvent>, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let connected = tokio::select! {
                result = self.connect_and_listen(&events) => match result {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "push channel connect failed");
                        false
                    }
                },
                _ = shutdown.cancelled() => return,
            };

            if connected {
                attempt = 0;
                let _ = events.send(PushEvent::Disconnected).await;
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempt + 1,
                "push channel reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Single connection lifecycle. `Ok(())` means the connection was
    /// established and later closed; `Err` means it never came up.
    async fn connect_and_listen(&self, events: &mpsc::Sender<PushEvent>) -> anyhow::Result<()> {
        tracing::info!(url = %redact_query(&self.ws_url), "connecting push channel");
        let (ws, _response) = tokio_tungstenite::connect_async(&self.ws_url).await?;
        let (mut sink, mut stream) = ws.split();

        let _ = events.send(PushEvent::Connected).await;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<AgentFrame>(16);

        // Ping task: keepalive every ping_interval.
        let ping_tx = outbound_tx.clone();
        let ping_interval = self.ping_interval;
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await; // skip the immediate tick
            loop {
                interval.tick().await;
                let frame = AgentFrame::Ping { timestamp: Some(Utc::now()) };
                if ping_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        // Writer task.
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize push frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        // Reader loop.
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    let Ok(frame) = serde_json::from_str::<AgentFrame>(&text) else {
                        tracing::debug!("ignoring unparseable push frame");
                        continue;
                    };
                    match frame {
                        AgentFrame::ConfigUpdated { .. } => {
                            let _ = events.send(PushEvent::ConfigUpdated).await;
                        }
                        AgentFrame::StatusChanged { status } => {
                            tracing::info!(status = %status, "control plane changed our status");
                            let _ = events.send(PushEvent::StatusChanged(status)).await;
                        }
                        AgentFrame::HeartbeatAck { config_changed } => {
                            if config_changed {
                                let _ = events.send(PushEvent::ConfigUpdated).await;
                            }
                        }
                        AgentFrame::Ping { timestamp } => {
                            let _ = outbound_tx.send(AgentFrame::Pong { timestamp }).await;
                        }
                        AgentFrame::Pong { .. } => {}
                        other => {
                            tracing::debug!(frame = ?std::mem::discriminant(&other), "unexpected push frame");
                        }
                    }
                }
                Message::Close(frame) => {
                    tracing::info!(code = ?frame.as_ref().map(|f| u16::from(f.code)), "push channel closed by server");
                    break;
                }
                _ => {}
            }
        }

        ping_task.abort();
        writer_task.abort();
        Ok(())
    }
}

/// http(s) base URL -> ws(s), trailing slash stripped.
pub(crate) fn ws_url_from_http(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

/// Minimal percent-encoding for a query value (tunnel keys carry `+`,
/// `/` and `=`).
pub(crate) fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_is_derived_from_http_base() {
        let client = PushChannelClient::new(
            "http://cp.internal:8001/",
            "app-01",
            "abc+def/ghi=",
            Duration::from_secs(30),
        );
        assert_eq!(
            client.ws_url(),
            "ws://cp.internal:8001/api/v1/ws/agent/app-01?public_key=abc%2Bdef%2Fghi%3D"
        );

        let secure = PushChannelClient::new(
            "https://cp.internal",
            "db-01",
            "key",
            Duration::from_secs(30),
        );
        assert!(secure.ws_url().starts_with("wss://cp.internal/api/v1/ws/agent/db-01"));
    }

    #[test]
    fn percent_encoding_covers_key_alphabet() {
        assert_eq!(percent_encode("AZaz09-._~"), "AZaz09-._~");
        assert_eq!(percent_encode("a+b/c="), "a%2Bb%2Fc%3D");
        assert_eq!(percent_encode("sp ace"), "sp%20ace");
    }

    #[test]
    fn redaction_drops_query() {
        assert_eq!(
            redact_query("ws://x/api/v1/ws/agent/h?public_key=secret"),
            "ws://x/api/v1/ws/agent/h"
        );
    }
}
