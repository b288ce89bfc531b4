//! The hub agent's side of the command channel.
//!
//! Connects to `/api/v1/ws/hub?api_key=…`, announces itself with a
//! `hello` carrying the current interface status, then serves commands
//! until the connection drops. Reconnects forever with exponential
//! backoff (reset on success); sends a periodic `status` frame so the
//! control plane's cached hub view stays fresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use nw_protocol::HubFrame;

use crate::backoff::ReconnectBackoff;
use crate::executor::TunnelExecutor;
use crate::hub::executor::CommandExecutor;
use crate::hub::status;

pub struct HubAgent {
    ws_url: String,
    executor: Arc<CommandExecutor>,
    tunnel: Arc<dyn TunnelExecutor>,
    status_interval: Duration,
    backoff: ReconnectBackoff,
}

impl HubAgent {
    pub fn new(
        base_url: &str,
        api_key: &str,
        executor: Arc<CommandExecutor>,
        tunnel: Arc<dyn TunnelExecutor>,
    ) -> Self {
        let ws_base = crate::push::ws_url_from_http(base_url);
        HubAgent {
            ws_url: format!("{ws_base}/api/v1/ws/hub?api_key={}", crate::push::percent_encode(api_key)),
            executor,
            tunnel,
            status_interval: Duration::from_secs(30),
            backoff: ReconnectBackoff::default(),
        }
    }

    /// Run until shutdown; reconnects forever.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let connected = tokio::select! {
                result = self.connect_and_serve(&shutdown) => match result {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "hub channel connect failed");
                        false
                    }
                },
                _ = shutdown.cancelled() => return,
            };

            if connected {
                attempt = 0;
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempt + 1,
                "hub channel reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
            attempt = attempt.saturating_add(1);
        }
    }

    async fn connect_and_serve(&self, shutdown: &CancellationToken) -> anyhow::Result<()> {
        tracing::info!("connecting to control plane command channel");
        let (ws, _response) = tokio_tungstenite::connect_async(&self.ws_url).await?;
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<HubFrame>(64);

        // Hello with the current interface status.
        let hello_status = status::interface_status(&self.tunnel)
            .await
            .unwrap_or(serde_json::Value::Null);
        outbound_tx
            .send(HubFrame::Hello { status: hello_status, timestamp: Utc::now() })
            .await
            .ok();

        // Periodic status reports.
        let status_tx = outbound_tx.clone();
        let status_tunnel = self.tunnel.clone();
        let status_interval = self.status_interval;
        let status_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(status_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Ok(data) = status::interface_status(&status_tunnel).await else {
                    continue;
                };
                if status_tx.send(HubFrame::Status { data }).await.is_err() {
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
                        tracing::error!(error = %e, "failed to serialize hub frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        // Reader loop: serve commands.
        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = shutdown.cancelled() => break,
            };
            let Some(Ok(msg)) = msg else { break };

            match msg {
                Message::Text(text) => {
                    let Ok(frame) = serde_json::from_str::<HubFrame>(&text) else {
                        tracing::debug!("ignoring unparseable frame from control plane");
                        continue;
                    };
                    match frame {
                        HubFrame::Welcome { .. } => {
                            tracing::info!("control plane welcomed us");
                        }
                        HubFrame::Command { id, command, payload, .. } => {
                            let executor = self.executor.clone();
                            let reply_tx = outbound_tx.clone();
                            // Commands run concurrently; responses
                            // correlate by id, not order.
                            tokio::spawn(async move {
                                let result = executor.execute(&command, payload).await;
                                let _ = reply_tx
                                    .send(HubFrame::Response {
                                        id,
                                        success: result.success,
                                        data: result.data,
                                        error: result.error,
                                    })
                                    .await;
                            });
                        }
                        HubFrame::Ping { timestamp } => {
                            let _ = outbound_tx.send(HubFrame::Pong { timestamp }).await;
                        }
                        HubFrame::Pong { .. } => {}
                        other => {
                            tracing::debug!(frame = ?std::mem::discriminant(&other), "unexpected frame");
                        }
                    }
                }
                Message::Close(frame) => {
                    tracing::info!(
                        code = ?frame.as_ref().map(|f| u16::from(f.code)),
                        "control plane closed the channel"
                    );
                    break;
                }
                _ => {}
            }
        }

        status_task.abort();
        writer_task.abort();
        Ok(())
    }
}
