use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use cosync_common::types::{ClientId, ConnectionId, DocumentId, PrincipalId};

use crate::auth::Principal;
use crate::session::SessionState;

// ── Outbound channel ─────────────────────────────────────────────────────────

/// Messages handed to a connection's write loop.
#[derive(Debug)]
pub enum Outbound {
    /// Serialized protocol frame.
    Frame(String),
    /// Transport-level ping for liveness probing.
    Ping,
    /// Close the socket with a code and reason, then stop the loop.
    Close { code: u16, reason: String },
}

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket connection currently known to the gateway.
#[derive(Debug)]
pub struct ConnectedClient {
    pub connection_id: ConnectionId,
    /// Replica identity declared in the `auth` frame, if any.
    pub client_id: Option<ClientId>,
    pub principal: Option<Principal>,
    pub state: SessionState,
    pub subscriptions: HashSet<DocumentId>,
    /// Channel into this connection's write loop.
    pub sender: mpsc::UnboundedSender<Outbound>,
    pub connected_at: Instant,
    pub last_pong: Instant,
}

impl ConnectedClient {
    pub fn new(connection_id: ConnectionId, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            client_id: None,
            principal: None,
            state: SessionState::Authenticating,
            subscriptions: HashSet::new(),
            sender,
            connected_at: now,
            last_pong: now,
        }
    }

    /// Vector-clock identity for this connection's writes: the declared
    /// client id, falling back to the connection id so two connections
    /// never share a clock entry.
    pub fn replica_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(&self.connection_id)
    }

    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(Outbound::Frame(frame.to_string())).is_ok()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectedClient>,
    by_principal: HashMap<PrincipalId, HashSet<ConnectionId>>,
    by_client: HashMap<ClientId, ConnectionId>,
}

/// Tracks live connections with secondary indexes by authenticated
/// principal and declared client id. All three maps sit behind one lock so
/// removal cascades atomically.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, client: ConnectedClient) {
        let connection_id = client.connection_id.clone();
        self.inner
            .write()
            .await
            .connections
            .insert(connection_id, client);
    }

    /// Remove a connection and every index entry pointing at it.
    pub async fn remove(&self, connection_id: &str) -> Option<ConnectedClient> {
        let mut inner = self.inner.write().await;
        let client = inner.connections.remove(connection_id)?;

        if let Some(principal) = &client.principal {
            if let Some(set) = inner.by_principal.get_mut(&principal.user_id) {
                set.remove(connection_id);
                if set.is_empty() {
                    inner.by_principal.remove(&principal.user_id);
                }
            }
        }
        if let Some(client_id) = &client.client_id {
            if inner.by_client.get(client_id).map(String::as_str) == Some(connection_id) {
                inner.by_client.remove(client_id);
            }
        }
        Some(client)
    }

    /// Attach an authenticated principal and mark the session established.
    pub async fn link_principal(&self, connection_id: &str, principal: Principal) {
        let mut inner = self.inner.write().await;
        inner
            .by_principal
            .entry(principal.user_id.clone())
            .or_default()
            .insert(connection_id.to_string());
        if let Some(client) = inner.connections.get_mut(connection_id) {
            client.principal = Some(principal);
            client.state = SessionState::Authenticated;
        }
    }

    /// Record the connection's declared replica identity. A reconnecting
    /// client takes the index entry over from its dead predecessor.
    pub async fn link_client(&self, connection_id: &str, client_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner
            .by_client
            .insert(client_id.to_string(), connection_id.to_string())
        {
            if previous != connection_id {
                debug!(client_id, previous, "registry: client id re-linked");
            }
        }
        if let Some(client) = inner.connections.get_mut(connection_id) {
            client.client_id = Some(client_id.to_string());
        }
    }

    pub async fn set_state(&self, connection_id: &str, state: SessionState) {
        if let Some(client) = self.inner.write().await.connections.get_mut(connection_id) {
            client.state = state;
        }
    }

    pub async fn is_authenticated(&self, connection_id: &str) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(connection_id)
            .is_some_and(|c| c.state.can_sync())
    }

    /// Send a serialized frame to one connection's write loop.
    pub async fn send_to(&self, connection_id: &str, frame: &str) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(connection_id)
            .is_some_and(|c| c.send(frame))
    }

    pub async fn send_outbound(&self, connection_id: &str, message: Outbound) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(connection_id)
            .is_some_and(|c| c.sender.send(message).is_ok())
    }

    pub async fn replica_id(&self, connection_id: &str) -> Option<ClientId> {
        self.inner
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|c| c.replica_id().to_string())
    }

    pub async fn principal(&self, connection_id: &str) -> Option<Principal> {
        self.inner
            .read()
            .await
            .connections
            .get(connection_id)
            .and_then(|c| c.principal.clone())
    }

    pub async fn add_subscription(&self, connection_id: &str, document_id: &str) {
        if let Some(client) = self.inner.write().await.connections.get_mut(connection_id) {
            client.subscriptions.insert(document_id.to_string());
        }
    }

    pub async fn remove_subscription(&self, connection_id: &str, document_id: &str) {
        if let Some(client) = self.inner.write().await.connections.get_mut(connection_id) {
            client.subscriptions.remove(document_id);
        }
    }

    pub async fn touch_pong(&self, connection_id: &str) {
        if let Some(client) = self.inner.write().await.connections.get_mut(connection_id) {
            client.last_pong = Instant::now();
        }
    }

    pub async fn last_pong(&self, connection_id: &str) -> Option<Instant> {
        self.inner
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|c| c.last_pong)
    }

    pub async fn connections_for_principal(&self, principal_id: &str) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_principal
            .get(principal_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn connection_for_client(&self, client_id: &str) -> Option<ConnectionId> {
        self.inner.read().await.by_client.get(client_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn principal_count(&self) -> usize {
        self.inner.read().await.by_principal.len()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.by_client.len()
    }

    /// Graceful shutdown: ask every write loop to close its socket.
    pub async fn close_all(&self, code: u16, reason: &str) {
        let inner = self.inner.read().await;
        for client in inner.connections.values() {
            let _ = client.sender.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;

    fn client(connection_id: &str) -> (ConnectedClient, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectedClient::new(connection_id.to_string(), tx), rx)
    }

    #[tokio::test]
    async fn remove_cascades_both_indexes() {
        let registry = ConnectionRegistry::new();
        let (c, _rx) = client("conn-1");
        registry.add(c).await;
        registry.link_principal("conn-1", Principal::anonymous()).await;
        registry.link_client("conn-1", "replica-1").await;

        assert_eq!(registry.connection_count().await, 1);
        assert_eq!(registry.principal_count().await, 1);
        assert_eq!(
            registry.connection_for_client("replica-1").await,
            Some("conn-1".to_string())
        );

        assert!(registry.remove("conn-1").await.is_some());
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.principal_count().await, 0);
        assert_eq!(registry.connection_for_client("replica-1").await, None);
    }

    #[tokio::test]
    async fn reconnect_takes_over_the_client_index() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = client("conn-a");
        let (b, _rx_b) = client("conn-b");
        registry.add(a).await;
        registry.add(b).await;
        registry.link_client("conn-a", "replica-1").await;
        registry.link_client("conn-b", "replica-1").await;

        assert_eq!(
            registry.connection_for_client("replica-1").await,
            Some("conn-b".to_string())
        );

        // Removing the stale connection must not evict the new owner.
        registry.remove("conn-a").await;
        assert_eq!(
            registry.connection_for_client("replica-1").await,
            Some("conn-b".to_string())
        );
    }

    #[tokio::test]
    async fn replica_id_falls_back_to_connection_id() {
        let registry = ConnectionRegistry::new();
        let (c, _rx) = client("conn-1");
        registry.add(c).await;
        assert_eq!(
            registry.replica_id("conn-1").await,
            Some("conn-1".to_string())
        );
        registry.link_client("conn-1", "replica-9").await;
        assert_eq!(
            registry.replica_id("conn-1").await,
            Some("replica-9".to_string())
        );
    }

    #[tokio::test]
    async fn only_authenticated_sessions_are_active() {
        let registry = ConnectionRegistry::new();
        let (c, _rx) = client("conn-1");
        registry.add(c).await;
        assert!(!registry.is_authenticated("conn-1").await);
        registry.link_principal("conn-1", Principal::anonymous()).await;
        assert!(registry.is_authenticated("conn-1").await);
        registry
            .set_state("conn-1", SessionState::Disconnecting)
            .await;
        assert!(!registry.is_authenticated("conn-1").await);
    }
}
