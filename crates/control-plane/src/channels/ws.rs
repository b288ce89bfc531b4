//! WebSocket endpoints for the two agent channels.
//!
//! Hub flow:
//! 1. Hub agent connects to `/api/v1/ws/hub?api_key=<shared-key>`
//! 2. Control plane sends `welcome`, hub answers with `hello`
//! 3. Commands flow down, `response`/`command_result` frames flow up
//!
//! Agent flow:
//! 1. Node agent connects to `/api/v1/ws/agent/{hostname}?public_key=…`
//! 2. Both identity fields must match an *active* node
//! 3. Agent sends `ping`/`heartbeat`; control plane pushes
//!    `config_updated` and `status_changed`
//!
//! Auth failures close with code 4001; a superseded connection closes
//! with code 1000. Absence of inbound traffic for 2 × ping_interval
//! kills the channel.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nw_domain::model::NodeStatus;
use nw_events::{event_type, Event};
use nw_protocol::{AgentFrame, HubFrame, CLOSE_AUTH_FAILED, CLOSE_SUPERSEDED};

use crate::service;
use crate::state::AppState;

/// Constant-time token comparison via SHA-256 digest. Hashing
/// normalizes lengths so `ct_eq` always compares 32 bytes.
fn token_matches(provided: &str, expected_hash: &[u8]) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    provided_hash.ct_eq(expected_hash).into()
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct HubWsQuery {
    pub api_key: Option<String>,
}

/// GET /api/v1/ws/hub — upgrade the hub agent's command channel.
pub async fn hub_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HubWsQuery>,
) -> impl IntoResponse {
    let provided = query.api_key.unwrap_or_default();
    let authorized = token_matches(&provided, &state.hub_api_key_hash);

    ws.on_upgrade(move |socket| async move {
        if !authorized {
            tracing::warn!("hub connection rejected: bad api key");
            if state.hub.note_auth_failure() {
                state
                    .bus
                    .publish_async(Event::new(
                        event_type::SECURITY_ALERT,
                        json!({
                            "alert": "repeated hub auth failures",
                            "channel": "hub",
                        }),
                    ))
                    .await;
            }
            close_with(socket, CLOSE_AUTH_FAILED, "invalid api key").await;
            return;
        }
        handle_hub_socket(socket, state).await;
    })
}

async fn handle_hub_socket(socket: WebSocket, state: AppState) {
    let (ws_sink, ws_stream) = socket.split();

    let (outbound_tx, outbound_rx) = mpsc::channel::<HubFrame>(64);
    let (epoch, closer) = state.hub.attach(outbound_tx.clone());

    let writer = tokio::spawn(hub_writer(ws_sink, outbound_rx, closer.clone()));

    if outbound_tx
        .send(HubFrame::Welcome { timestamp: Utc::now() })
        .await
        .is_err()
    {
        tracing::warn!("failed to queue welcome for hub agent");
    }

    hub_reader(ws_stream, &state, &outbound_tx, &closer).await;

    state.hub.detach(epoch);
    writer.abort();
}

async fn hub_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<HubFrame>,
    closer: CancellationToken,
) {
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
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
            _ = closer.cancelled() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_SUPERSEDED,
                        reason: "replaced by new connection".into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn hub_reader(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    outbound_tx: &mpsc::Sender<HubFrame>,
    closer: &CancellationToken,
) {
    let idle = state.hub.idle_timeout();
    loop {
        let msg = tokio::select! {
            msg = tokio::time::timeout(idle, stream.next()) => match msg {
                Ok(m) => m,
                Err(_) => {
                    tracing::warn!(idle_secs = idle.as_secs(), "hub channel idle, dropping");
                    break;
                }
            },
            _ = closer.cancelled() => break,
        };

        let Some(Ok(msg)) = msg else { break };
        match msg {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<HubFrame>(&text) else {
                    tracing::debug!("ignoring unparseable hub frame");
                    continue;
                };
                handle_hub_frame(state, outbound_tx, frame).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => state.hub.touch(),
            _ => {}
        }
    }
}

async fn handle_hub_frame(state: &AppState, outbound_tx: &mpsc::Sender<HubFrame>, frame: HubFrame) {
    state.hub.touch();
    match frame {
        HubFrame::Hello { status, .. } => {
            tracing::info!("hub agent said hello");
            state.hub.update_status(status);
        }
        HubFrame::Response { id, success, data, error }
        | HubFrame::CommandResult { id, success, data, error } => {
            state.hub.complete(&id, success, data, error);
        }
        HubFrame::Status { data } => state.hub.update_status(data),
        HubFrame::Ping { timestamp } => {
            let _ = outbound_tx.send(HubFrame::Pong { timestamp }).await;
        }
        HubFrame::Pong { .. } => {}
        other => {
            tracing::debug!(frame = ?std::mem::discriminant(&other), "unexpected hub frame");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct AgentWsQuery {
    pub public_key: Option<String>,
}

/// GET /api/v1/ws/agent/{hostname} — upgrade a node agent's push
/// channel. Hostname and public key must match an active node.
pub async fn agent_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(hostname): Path<String>,
    Query(query): Query<AgentWsQuery>,
) -> impl IntoResponse {
    let provided_key = query.public_key.unwrap_or_default();

    let node = match state.registry.node_by_hostname(&hostname) {
        Ok(node) => node,
        Err(_) => {
            return ws.on_upgrade(|socket| close_with(socket, CLOSE_AUTH_FAILED, "unknown node"))
        }
    };
    if node.public_key != provided_key {
        tracing::warn!(hostname = %hostname, "agent connection rejected: key mismatch");
        return ws.on_upgrade(|socket| close_with(socket, CLOSE_AUTH_FAILED, "key mismatch"));
    }
    if node.status != NodeStatus::Active {
        return ws.on_upgrade(|socket| close_with(socket, CLOSE_AUTH_FAILED, "node not active"));
    }

    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, hostname, node.id))
}

async fn handle_agent_socket(socket: WebSocket, state: AppState, hostname: String, node_id: u64) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<AgentFrame>(64);
    let (conn_id, closer) = state.agents.register(&hostname, node_id, outbound_tx.clone());

    let writer_closer = closer.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let json = match serde_json::to_string(&frame) {
                        Ok(j) => j,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to serialize agent frame");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                _ = writer_closer.cancelled() => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_SUPERSEDED,
                            reason: "replaced by new connection".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let idle = state.config.ping_interval * 2;
    loop {
        let msg = tokio::select! {
            msg = tokio::time::timeout(idle, ws_stream.next()) => match msg {
                Ok(m) => m,
                Err(_) => {
                    tracing::warn!(hostname = %hostname, "agent channel idle, dropping");
                    break;
                }
            },
            _ = closer.cancelled() => break,
        };

        let Some(Ok(msg)) = msg else { break };
        match msg {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<AgentFrame>(&text) else {
                    tracing::debug!(hostname = %hostname, "ignoring unparseable agent frame");
                    continue;
                };
                handle_agent_frame(&state, &hostname, &outbound_tx, frame).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => state.agents.touch(&hostname),
            _ => {}
        }
    }

    state.agents.remove(&hostname, conn_id);
    writer.abort();
}

async fn handle_agent_frame(
    state: &AppState,
    hostname: &str,
    outbound_tx: &mpsc::Sender<AgentFrame>,
    frame: AgentFrame,
) {
    state.agents.touch(hostname);
    match frame {
        AgentFrame::Ping { timestamp } => {
            let _ = outbound_tx.send(AgentFrame::Pong { timestamp }).await;
        }
        AgentFrame::Heartbeat { metrics, agent_hash, config_version, .. } => {
            let config_changed = match service::process_heartbeat(
                state,
                hostname,
                metrics,
                agent_hash,
                config_version,
                None,
            )
            .await
            {
                Ok(response) => response.config_changed,
                Err(e) => {
                    tracing::warn!(hostname = %hostname, error = %e, "heartbeat processing failed");
                    false
                }
            };
            let _ = outbound_tx.send(AgentFrame::HeartbeatAck { config_changed }).await;
        }
        other => {
            tracing::debug!(
                hostname = %hostname,
                frame = ?std::mem::discriminant(&other),
                "unexpected agent frame"
            );
        }
    }
}
