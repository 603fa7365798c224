use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cosync_protocol::{close, parse_frame, Frame, MALFORMED_FRAME_LIMIT};

use crate::registry::{ConnectedClient, Outbound};
use crate::session::SessionState;
use crate::state::GatewayState;

/// Handle a single WebSocket connection through its full lifecycle:
/// capacity gate → auth phase → message loop → cleanup.
pub async fn handle_connection(mut socket: WebSocket, state: Arc<GatewayState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();

    // Capacity gate: reject before the session starts.
    if state.registry.connection_count().await >= state.config.server.max_connections {
        warn!(conn_id = %conn_id, "ws: at capacity, rejecting");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close::POLICY,
                reason: "Server at maximum capacity".into(),
            })))
            .await;
        return;
    }
    info!(conn_id = %conn_id, "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<Outbound>();

    // Spawn write loop: forwards outbound messages to the WebSocket.
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            let result = match msg {
                Outbound::Frame(text) => ws_tx.send(Message::Text(text.into())).await,
                Outbound::Ping => ws_tx.send(Message::Ping(Vec::new().into())).await,
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    // Socket open: the session is now AUTHENTICATING and the heartbeat runs.
    state
        .registry
        .add(ConnectedClient::new(conn_id.clone(), client_tx.clone()))
        .await;

    let cancel = CancellationToken::new();
    let heartbeat = spawn_heartbeat(&state, &conn_id, &cancel);

    // ── Auth phase ───────────────────────────────────────────────────────

    let authed = tokio::time::timeout(
        state.auth_timeout(),
        auth_phase(&mut ws_rx, &state, &conn_id, &client_tx),
    )
    .await;

    match authed {
        Ok(AuthOutcome::Authenticated) => {}
        Ok(AuthOutcome::Rejected) => {
            teardown(&state, &conn_id, &cancel).await;
            heartbeat.abort();
            write_handle_finish(client_tx, write_handle).await;
            return;
        }
        Ok(AuthOutcome::Closed) => {
            debug!(conn_id = %conn_id, "ws: closed before auth");
            teardown(&state, &conn_id, &cancel).await;
            heartbeat.abort();
            write_handle_finish(client_tx, write_handle).await;
            return;
        }
        Err(_) => {
            warn!(conn_id = %conn_id, "ws: auth timeout");
            let _ = client_tx.send(Outbound::Frame(
                Frame::auth_error("authentication timed out").encode(),
            ));
            let _ = client_tx.send(Outbound::Close {
                code: close::POLICY,
                reason: "authentication timed out".into(),
            });
            teardown(&state, &conn_id, &cancel).await;
            heartbeat.abort();
            write_handle_finish(client_tx, write_handle).await;
            return;
        }
    }

    // ── Message loop ─────────────────────────────────────────────────────

    let mut malformed = 0u32;
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let Some(msg) = msg else { break };
        let msg = match msg {
            Ok(msg) => msg,
            Err(error) => {
                debug!(conn_id = %conn_id, %error, "ws: read error");
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Pong(_) => {
                state.registry.touch_pong(&conn_id).await;
                continue;
            }
            Message::Close(_) => break,
            // Binary frames are not part of the protocol; pings are answered
            // by the transport layer.
            _ => continue,
        };

        match parse_frame(&text) {
            Ok(frame) => handle_frame(&state, &conn_id, frame).await,
            Err(error) => {
                malformed += 1;
                warn!(conn_id = %conn_id, %error, malformed, "ws: bad frame");
                let _ = client_tx.send(Outbound::Frame(
                    Frame::error(error.to_string(), None).encode(),
                ));
                if malformed > MALFORMED_FRAME_LIMIT {
                    warn!(conn_id = %conn_id, "ws: malformed frame limit exceeded");
                    break;
                }
            }
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    teardown(&state, &conn_id, &cancel).await;
    heartbeat.abort();
    write_handle_finish(client_tx, write_handle).await;
}

enum AuthOutcome {
    Authenticated,
    Rejected,
    Closed,
}

/// Drain frames until a valid `auth` arrives. Sync traffic before auth is
/// answered with an `error` frame; an invalid token rejects with
/// `auth_error` and close code 1008.
async fn auth_phase(
    ws_rx: &mut SplitStream<WebSocket>,
    state: &Arc<GatewayState>,
    conn_id: &str,
    client_tx: &mpsc::UnboundedSender<Outbound>,
) -> AuthOutcome {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) => return AuthOutcome::Closed,
            Ok(Message::Pong(_)) => {
                state.registry.touch_pong(conn_id).await;
                continue;
            }
            Ok(_) => continue,
            Err(_) => return AuthOutcome::Closed,
        };

        let frame = match parse_frame(&text) {
            Ok(frame) => frame,
            Err(error) => {
                let _ = client_tx.send(Outbound::Frame(
                    Frame::error(error.to_string(), None).encode(),
                ));
                continue;
            }
        };

        match frame {
            Frame::Auth {
                token,
                api_key,
                client_id,
                ..
            } => {
                let credential = token.as_deref().or(api_key.as_deref());
                match state.verifier.verify_token(credential).await {
                    Some(principal) => {
                        if let Some(client_id) = &client_id {
                            state.registry.link_client(conn_id, client_id).await;
                        }
                        let user_id = principal.user_id.clone();
                        let permissions = principal.permissions.clone();
                        state.registry.link_principal(conn_id, principal).await;
                        let _ = client_tx.send(Outbound::Frame(
                            Frame::auth_success(&user_id, permissions).encode(),
                        ));
                        info!(
                            conn_id = %conn_id,
                            user_id = %user_id,
                            client_id = client_id.as_deref().unwrap_or(conn_id),
                            "ws: authenticated"
                        );
                        return AuthOutcome::Authenticated;
                    }
                    None => {
                        warn!(conn_id = %conn_id, "ws: auth rejected");
                        state
                            .registry
                            .set_state(conn_id, SessionState::Disconnecting)
                            .await;
                        let _ = client_tx.send(Outbound::Frame(
                            Frame::auth_error("invalid token").encode(),
                        ));
                        let _ = client_tx.send(Outbound::Close {
                            code: close::POLICY,
                            reason: "authentication failed".into(),
                        });
                        return AuthOutcome::Rejected;
                    }
                }
            }
            Frame::Ping { .. } => {
                let _ = client_tx.send(Outbound::Frame(Frame::pong().encode()));
            }
            Frame::SyncRequest { .. } | Frame::Delta { .. } => {
                let _ = client_tx.send(Outbound::Frame(
                    Frame::error("not authenticated", None).encode(),
                ));
            }
            _ => {
                debug!(conn_id = %conn_id, "ws: ignoring frame before auth");
            }
        }
    }
    AuthOutcome::Closed
}

/// Dispatch one parsed frame from an authenticated session.
async fn handle_frame(state: &Arc<GatewayState>, conn_id: &str, frame: Frame) {
    match frame {
        Frame::SyncRequest {
            id,
            document_id,
            vector_clock,
            ..
        } => handle_sync_request(state, conn_id, id, document_id, vector_clock).await,
        Frame::Delta {
            timestamp,
            document_id,
            delta,
            vector_clock,
            ..
        } => handle_delta(state, conn_id, timestamp, document_id, delta, vector_clock).await,
        Frame::Ack { message_id, .. } => {
            state.delivery.ack_received(conn_id, &message_id).await;
        }
        Frame::Ping { .. } => {
            let _ = state
                .registry
                .send_to(conn_id, &Frame::pong().encode())
                .await;
        }
        Frame::Pong { .. } => {
            state.registry.touch_pong(conn_id).await;
        }
        Frame::Auth { .. } => {
            let _ = state
                .registry
                .send_to(conn_id, &Frame::error("already authenticated", None).encode())
                .await;
        }
        // Server-to-client frames echoed back by a confused peer.
        other => {
            debug!(conn_id = %conn_id, frame_id = %other.id(), "ws: ignoring server-bound frame");
        }
    }
}

async fn handle_sync_request(
    state: &Arc<GatewayState>,
    conn_id: &str,
    request_id: String,
    document_id: String,
    vector_clock: Option<cosync_replica::VectorClock>,
) {
    let Some(principal) = state.registry.principal(conn_id).await else {
        let _ = state
            .registry
            .send_to(conn_id, &Frame::error("not authenticated", None).encode())
            .await;
        return;
    };
    if !principal.permissions.can_read_document(&document_id) {
        warn!(conn_id = %conn_id, document_id, "ws: read denied");
        let _ = state
            .registry
            .send_to(
                conn_id,
                &Frame::error(
                    "permission denied",
                    Some(serde_json::json!({ "documentId": document_id })),
                )
                .encode(),
            )
            .await;
        return;
    }

    // The reported clock is a checkpoint observation; fold it in.
    if let Some(clock) = vector_clock {
        state
            .coordinator
            .merge_vector_clock(&document_id, &clock)
            .await;
    }

    state.coordinator.subscribe(&document_id, conn_id).await;
    state.registry.add_subscription(conn_id, &document_id).await;
    let snapshot = state.coordinator.get_document_state(&document_id).await;
    debug!(conn_id = %conn_id, document_id, fields = snapshot.len(), "ws: sync response");
    let _ = state
        .registry
        .send_to(
            conn_id,
            &Frame::sync_response(request_id, document_id, snapshot).encode(),
        )
        .await;
}

async fn handle_delta(
    state: &Arc<GatewayState>,
    conn_id: &str,
    timestamp: u64,
    document_id: String,
    delta: std::collections::BTreeMap<String, cosync_replica::FieldValue>,
    vector_clock: cosync_replica::VectorClock,
) {
    let Some(principal) = state.registry.principal(conn_id).await else {
        let _ = state
            .registry
            .send_to(conn_id, &Frame::error("not authenticated", None).encode())
            .await;
        return;
    };
    if !principal.permissions.can_write_document(&document_id) {
        warn!(conn_id = %conn_id, document_id, "ws: write denied");
        let _ = state
            .registry
            .send_to(
                conn_id,
                &Frame::error(
                    "permission denied",
                    Some(serde_json::json!({ "documentId": document_id })),
                )
                .encode(),
            )
            .await;
        return;
    }

    let replica_id = state
        .registry
        .replica_id(conn_id)
        .await
        .unwrap_or_else(|| conn_id.to_string());

    // A writer is implicitly a subscriber: it must observe the resolution
    // of its own writes.
    state.coordinator.subscribe(&document_id, conn_id).await;
    state.registry.add_subscription(conn_id, &document_id).await;

    for (field, value) in delta {
        let authoritative = state
            .coordinator
            .set_field(&document_id, &field, value, &replica_id, Some(timestamp))
            .await;
        state
            .delivery
            .enqueue(&document_id, &field, authoritative)
            .await;
    }
    state
        .coordinator
        .merge_vector_clock(&document_id, &vector_clock)
        .await;
}

fn spawn_heartbeat(
    state: &Arc<GatewayState>,
    conn_id: &str,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let state = Arc::clone(state);
    let conn_id = conn_id.to_string();
    let cancel = cancel.clone();
    let interval = state.heartbeat_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick is immediate
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(last_pong) = state.registry.last_pong(&conn_id).await else {
                break;
            };
            if last_pong.elapsed() > interval * 2 {
                warn!(conn_id = %conn_id, "ws: heartbeat missed, terminating");
                state
                    .registry
                    .set_state(&conn_id, SessionState::Disconnecting)
                    .await;
                let _ = state
                    .registry
                    .send_outbound(
                        &conn_id,
                        Outbound::Close {
                            code: close::NORMAL,
                            reason: "heartbeat timeout".into(),
                        },
                    )
                    .await;
                cancel.cancel();
                break;
            }
            let _ = state.registry.send_outbound(&conn_id, Outbound::Ping).await;
        }
    })
}

/// Unhook the connection from everything it touched. Subscriber sets and
/// pending ACKs are owned per-connection, so this is the whole cleanup.
async fn teardown(state: &Arc<GatewayState>, conn_id: &str, cancel: &CancellationToken) {
    cancel.cancel();
    state
        .registry
        .set_state(conn_id, SessionState::Disconnected)
        .await;
    let removed = state.registry.remove(conn_id).await;
    state.coordinator.unsubscribe_all(conn_id).await;
    state.delivery.cancel_connection(conn_id).await;

    let duration = removed
        .map(|c| c.connected_at.elapsed())
        .unwrap_or_default();
    info!(
        conn_id = %conn_id,
        duration_secs = duration.as_secs(),
        "ws: connection closed"
    );
}

/// Let the write loop drain queued frames (auth errors, close) before the
/// handler returns. The registry's sender clone is gone after `teardown`,
/// so dropping ours closes the channel.
async fn write_handle_finish(
    client_tx: mpsc::UnboundedSender<Outbound>,
    write_handle: tokio::task::JoinHandle<()>,
) {
    drop(client_tx);
    if tokio::time::timeout(std::time::Duration::from_secs(5), write_handle)
        .await
        .is_err()
    {
        debug!("ws: write loop drain timed out");
    }
}
