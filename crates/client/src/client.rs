use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cosync_common::time::epoch_millis;
use cosync_common::types::{ClientId, MessageId};
use cosync_common::{CosyncError, Result};
use cosync_protocol::{
    new_id, parse_frame, Frame, SYNC_MAX_RETRIES, SYNC_RETRY_BASE_MS, SYNC_TIMEOUT_MS,
};
use cosync_replica::FieldValue;

use crate::replica::{ClientReplica, QueuedOp};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect backoff is capped at this many doublings.
const RECONNECT_BACKOFF_CAP: u32 = 6;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway WebSocket URL, e.g. `ws://127.0.0.1:18900/ws`.
    pub url: String,
    pub token: Option<String>,
    /// Replica identity; keys this client's vector-clock entries.
    pub client_id: ClientId,
    /// Bound on one `sync_request` round trip.
    pub sync_timeout: Duration,
    pub sync_max_retries: u32,
    pub sync_retry_base: Duration,
    /// Reconnect automatically (with backoff) when the socket drops.
    pub reconnect: bool,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, client_id: impl Into<ClientId>) -> Self {
        Self {
            url: url.into(),
            token: None,
            client_id: client_id.into(),
            sync_timeout: Duration::from_millis(SYNC_TIMEOUT_MS),
            sync_max_retries: SYNC_MAX_RETRIES,
            sync_retry_base: Duration::from_millis(SYNC_RETRY_BASE_MS),
            reconnect: true,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

struct ClientInner {
    config: ClientConfig,
    replica: Mutex<ClientReplica>,
    /// Sender into the current connection's write task, when connected.
    conn: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// In-flight `sync_request`s awaiting their `sync_response`.
    pending_syncs: Mutex<HashMap<MessageId, oneshot::Sender<()>>>,
    shutdown: CancellationToken,
}

/// Handle to the client replica. Writes never block on the network: they
/// apply locally first and either go out on the live socket or join the
/// offline queue for replay after the next authentication.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Create a client in the disconnected state. Writes queue until
    /// [`SyncClient::connect`] succeeds.
    pub fn new(config: ClientConfig) -> Self {
        let replica = ClientReplica::new(config.client_id.clone());
        Self {
            inner: Arc::new(ClientInner {
                config,
                replica: Mutex::new(replica),
                conn: Mutex::new(None),
                pending_syncs: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Connect and authenticate, then flush the offline queue.
    pub async fn connect(&self) -> Result<()> {
        establish(Arc::clone(&self.inner)).await
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.conn.lock().await.is_some()
    }

    /// Stop reconnecting and drop the socket.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        *self.inner.conn.lock().await = None;
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Set a field: local cache updates immediately; the delta goes out now
    /// or queues for the next connection.
    pub async fn set_field(&self, document_id: &str, field: &str, value: serde_json::Value) {
        let mut replica = self.inner.replica.lock().await;
        replica.local_set(document_id, field, value.clone());

        let conn = self.inner.conn.lock().await;
        let sent = match conn.as_ref() {
            Some(tx) => {
                let frame = replica.make_delta(document_id, field, FieldValue::Value(value.clone()));
                tx.send(Message::Text(frame.encode().into())).is_ok()
            }
            None => false,
        };
        if !sent {
            replica.enqueue(QueuedOp::Set {
                document_id: document_id.to_string(),
                field: field.to_string(),
                value,
            });
        }
    }

    /// Delete a field: local erase plus an outbound tombstone or queue entry.
    pub async fn delete_field(&self, document_id: &str, field: &str) {
        let mut replica = self.inner.replica.lock().await;
        replica.local_delete(document_id, field);

        let conn = self.inner.conn.lock().await;
        let sent = match conn.as_ref() {
            Some(tx) => {
                let frame = replica.make_delta(document_id, field, FieldValue::Tombstone);
                tx.send(Message::Text(frame.encode().into())).is_ok()
            }
            None => false,
        };
        if !sent {
            replica.enqueue(QueuedOp::Delete {
                document_id: document_id.to_string(),
                field: field.to_string(),
            });
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// The local view of a document. First access subscribes: it sends a
    /// `sync_request` and awaits the snapshot, retrying with exponential
    /// backoff before surfacing a timeout.
    pub async fn document(
        &self,
        document_id: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        {
            let replica = self.inner.replica.lock().await;
            if replica.is_subscribed(document_id) {
                return Ok(replica.snapshot(document_id));
            }
        }

        for attempt in 0..self.inner.config.sync_max_retries {
            if attempt > 0 {
                let backoff = self.inner.config.sync_retry_base * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
            if self.try_sync(document_id).await {
                let replica = self.inner.replica.lock().await;
                return Ok(replica.snapshot(document_id));
            }
        }
        Err(CosyncError::SyncTimeout(document_id.to_string()))
    }

    /// One subscription attempt: send `sync_request`, await the response.
    async fn try_sync(&self, document_id: &str) -> bool {
        let request_id = new_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_syncs
            .lock()
            .await
            .insert(request_id.clone(), tx);

        let frame = {
            let replica = self.inner.replica.lock().await;
            Frame::SyncRequest {
                id: request_id.clone(),
                timestamp: epoch_millis(),
                document_id: document_id.to_string(),
                vector_clock: Some(replica.clock(document_id)),
            }
        };
        let sent = send_frame(&self.inner, &frame).await;

        let ok = if sent {
            matches!(
                tokio::time::timeout(self.inner.config.sync_timeout, rx).await,
                Ok(Ok(()))
            )
        } else {
            false
        };
        if !ok {
            self.inner.pending_syncs.lock().await.remove(&request_id);
            debug!(document_id, "client: sync attempt failed");
        }
        ok
    }

    /// Local read; `None` until the field is known locally.
    pub async fn get_field(&self, document_id: &str, field: &str) -> Option<serde_json::Value> {
        self.inner.replica.lock().await.get_field(document_id, field)
    }

    /// Local snapshot without subscribing.
    pub async fn local_snapshot(
        &self,
        document_id: &str,
    ) -> serde_json::Map<String, serde_json::Value> {
        self.inner.replica.lock().await.snapshot(document_id)
    }

    pub async fn queued_ops(&self) -> usize {
        self.inner.replica.lock().await.queue_len()
    }
}

// ── Connection plumbing ──────────────────────────────────────────────────────

async fn send_frame(inner: &Arc<ClientInner>, frame: &Frame) -> bool {
    let conn = inner.conn.lock().await;
    conn.as_ref()
        .is_some_and(|tx| tx.send(Message::Text(frame.encode().into())).is_ok())
}

/// Dial, authenticate, wire the read loop, flush the offline queue.
///
/// Boxed to break the opaque-type inference cycle created by
/// `establish` -> spawn(`read_loop`) -> spawn(`reconnect_loop`) -> await `establish`.
fn establish(inner: Arc<ClientInner>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        if inner.shutdown.is_cancelled() {
            return Err(CosyncError::Client("client is shut down".into()));
        }

        let (socket, _) = connect_async(inner.config.url.as_str())
            .await
            .map_err(|e| CosyncError::Client(format!("connect failed: {e}")))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        // Authenticate before anything else flows.
        let auth = Frame::Auth {
            id: new_id(),
            timestamp: epoch_millis(),
            token: inner.config.token.clone(),
            api_key: None,
            client_id: Some(inner.config.client_id.clone()),
        };
        ws_tx
            .send(Message::Text(auth.encode().into()))
            .await
            .map_err(|e| CosyncError::Client(format!("auth send failed: {e}")))?;
        wait_for_auth(&mut ws_rx, inner.config.sync_timeout).await?;

        // Write task: forwards messages to the socket until the channel closes.
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        *inner.conn.lock().await = Some(tx);
        // Stale subscriptions refer to the old socket; next access re-syncs.
        inner.replica.lock().await.clear_subscriptions();

        tokio::spawn(read_loop(Arc::clone(&inner), ws_rx));

        flush_queue(&inner).await;
        info!(url = %inner.config.url, client_id = %inner.config.client_id, "client: connected");
        Ok(())
    })
}

async fn wait_for_auth(ws_rx: &mut SplitStream<Socket>, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws_rx.next())
            .await
            .map_err(|_| CosyncError::Auth("timed out waiting for auth reply".into()))?;
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(CosyncError::Client(format!("socket error: {e}"))),
            None => return Err(CosyncError::Client("socket closed during auth".into())),
        };
        let Message::Text(text) = msg else { continue };
        match parse_frame(text.as_str()) {
            Ok(Frame::AuthSuccess { user_id, .. }) => {
                debug!(%user_id, "client: authenticated");
                return Ok(());
            }
            Ok(Frame::AuthError { error, .. }) => return Err(CosyncError::Auth(error)),
            Ok(_) | Err(_) => continue,
        }
    }
}

/// Replay queued offline ops in insertion order. An op is only popped after
/// its delta is handed to the write task; if the connection drops mid-flush
/// the suffix stays queued for the next flush.
async fn flush_queue(inner: &Arc<ClientInner>) {
    loop {
        let (frame, queued) = {
            let mut replica = inner.replica.lock().await;
            let Some(op) = replica.front_op() else { break };
            (replica.make_delta_for_op(&op), op)
        };
        if send_frame(inner, &frame).await {
            inner.replica.lock().await.pop_front_op();
            debug!(document_id = queued.document_id(), "client: flushed queued op");
        } else {
            warn!("client: flush interrupted, retaining queue suffix");
            break;
        }
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut ws_rx: SplitStream<Socket>) {
    loop {
        let msg = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            msg = ws_rx.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => handle_frame(&inner, text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                debug!(%error, "client: read error");
                break;
            }
        }
    }

    // Disconnected: drop the stale sender and fail in-flight syncs.
    *inner.conn.lock().await = None;
    inner.pending_syncs.lock().await.clear();

    if inner.config.reconnect && !inner.shutdown.is_cancelled() {
        info!("client: connection lost, reconnecting");
        tokio::spawn(reconnect_loop(inner));
    }
}

async fn handle_frame(inner: &Arc<ClientInner>, text: &str) {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(%error, "client: bad frame from server");
            return;
        }
    };
    match frame {
        Frame::Delta {
            id,
            document_id,
            delta,
            vector_clock,
            ..
        } => {
            inner
                .replica
                .lock()
                .await
                .apply_delta(&document_id, &delta, &vector_clock);
            // Every delta is ACKed, duplicates included.
            send_frame(inner, &Frame::ack(id)).await;
        }
        Frame::SyncResponse {
            request_id,
            document_id,
            state,
            ..
        } => {
            inner.replica.lock().await.apply_snapshot(&document_id, state);
            if let Some(tx) = inner.pending_syncs.lock().await.remove(&request_id) {
                let _ = tx.send(());
            }
        }
        Frame::Ping { .. } => {
            send_frame(inner, &Frame::pong()).await;
        }
        Frame::Error { error, details, .. } => {
            warn!(%error, ?details, "client: server error frame");
        }
        _ => {}
    }
}

async fn reconnect_loop(inner: Arc<ClientInner>) {
    let mut attempt = 0u32;
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }
        tokio::time::sleep(reconnect_backoff(attempt)).await;
        match establish(Arc::clone(&inner)).await {
            Ok(()) => return,
            Err(error) => {
                debug!(%error, attempt, "client: reconnect failed");
                attempt += 1;
            }
        }
    }
}

fn reconnect_backoff(attempt: u32) -> Duration {
    let base = SYNC_RETRY_BASE_MS * 2u64.pow(attempt.min(RECONNECT_BACKOFF_CAP));
    let jitter = rand::rng().random_range(0..SYNC_RETRY_BASE_MS);
    Duration::from_millis(base + jitter)
}
