use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use cosync_common::time::epoch_millis;
use cosync_common::types::{ConnectionId, DocumentId};
use cosync_replica::{DocumentReplica, FieldValue, VectorClock};

use crate::storage::{AuditDelta, OperationKind, StorageAdapter};

/// Mutable state of one active document. Always mutated under its own lock,
/// so the `(replica, clock, subscribers, last_modified)` record changes
/// atomically while unrelated documents progress in parallel.
pub struct DocumentState {
    pub replica: DocumentReplica,
    pub clock: VectorClock,
    pub subscribers: HashSet<ConnectionId>,
    pub last_modified: u64,
}

impl DocumentState {
    fn empty() -> Self {
        Self {
            replica: DocumentReplica::new(),
            clock: VectorClock::new(),
            subscribers: HashSet::new(),
            last_modified: epoch_millis(),
        }
    }
}

/// Mediates every read, write, delete, subscribe and clock merge against the
/// per-document state records. Documents are created lazily on first access
/// and retained for the life of the process; restart recovery goes through
/// the storage adapter when one is configured.
pub struct SyncCoordinator {
    documents: RwLock<HashMap<DocumentId, Arc<Mutex<DocumentState>>>>,
    storage: Option<Arc<dyn StorageAdapter>>,
}

impl SyncCoordinator {
    pub fn new(storage: Option<Arc<dyn StorageAdapter>>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            storage,
        }
    }

    /// Fetch a document's state record, creating it (from storage when
    /// configured, empty otherwise) on first access. Never fails: storage
    /// errors are logged and fall through to empty creation.
    pub async fn get_or_create_document(&self, document_id: &str) -> Arc<Mutex<DocumentState>> {
        if let Some(doc) = self.documents.read().await.get(document_id).cloned() {
            return doc;
        }

        // Load outside both locks; if two callers race, the first insert wins
        // and the duplicate load is discarded.
        let loaded = self.load_document(document_id).await;
        let mut documents = self.documents.write().await;
        Arc::clone(
            documents
                .entry(document_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(loaded))),
        )
    }

    async fn load_document(&self, document_id: &str) -> DocumentState {
        let Some(storage) = &self.storage else {
            return DocumentState::empty();
        };

        let mut state = DocumentState::empty();
        match storage.get_document(document_id).await {
            Ok(Some(stored)) => {
                for (path, value) in stored.fields {
                    state.replica.restore_field(&path, value);
                }
                state.last_modified = stored.updated_at;
                debug!(document_id, fields = state.replica.len(), "document loaded");
            }
            Ok(None) => {}
            Err(error) => {
                warn!(document_id, %error, "storage: document load failed, starting empty");
            }
        }
        match storage.get_vector_clock(document_id).await {
            Ok(clock) => state.clock.merge(&clock),
            Err(error) => {
                warn!(document_id, %error, "storage: clock load failed, starting empty");
            }
        }
        state
    }

    /// Apply one field write: tick the writer's clock entry, run LWW, bump
    /// `last_modified`, persist best-effort. Returns the authoritative value
    /// for the field after the decision.
    pub async fn set_field(
        &self,
        document_id: &str,
        path: &str,
        value: FieldValue,
        client_id: &str,
        write_ts: Option<u64>,
    ) -> Option<serde_json::Value> {
        let operation = if value.is_tombstone() {
            OperationKind::Delete
        } else {
            OperationKind::Set
        };
        let write_ts = write_ts.unwrap_or_else(epoch_millis);
        let doc = self.get_or_create_document(document_id).await;

        let (authoritative, counter, snapshot) = {
            let mut state = doc.lock().await;
            let counter = state.clock.tick(client_id);
            let authoritative =
                state
                    .replica
                    .set_field(path, value.clone(), counter, client_id, write_ts);
            state.last_modified = epoch_millis();
            (authoritative, counter, state.replica.snapshot())
        };

        self.persist_write(document_id, client_id, operation, path, value, counter, snapshot)
            .await;
        authoritative
    }

    /// Delete a field (tombstone write). Returns `None` when the delete won.
    pub async fn delete_field(
        &self,
        document_id: &str,
        path: &str,
        client_id: &str,
        write_ts: Option<u64>,
    ) -> Option<serde_json::Value> {
        self.set_field(document_id, path, FieldValue::Tombstone, client_id, write_ts)
            .await
    }

    async fn persist_write(
        &self,
        document_id: &str,
        client_id: &str,
        operation: OperationKind,
        path: &str,
        value: FieldValue,
        counter: u64,
        snapshot: serde_json::Map<String, serde_json::Value>,
    ) {
        let Some(storage) = &self.storage else {
            return;
        };

        if let Err(error) = storage.save_document(document_id, &snapshot).await {
            warn!(document_id, %error, "storage: snapshot persist failed");
        }
        if let Err(error) = storage
            .update_vector_clock(document_id, client_id, counter)
            .await
        {
            warn!(document_id, %error, "storage: clock persist failed");
        }
        let audit = AuditDelta {
            document_id: document_id.to_string(),
            client_id: client_id.to_string(),
            operation,
            field_path: path.to_string(),
            value: value.into_value(),
            clock_value: counter,
        };
        if let Err(error) = storage.save_delta(&audit).await {
            warn!(document_id, %error, "storage: audit delta persist failed");
        }
    }

    /// Current value of one field; `None` for unknown documents or fields.
    pub async fn get_field(&self, document_id: &str, path: &str) -> Option<serde_json::Value> {
        let doc = self.documents.read().await.get(document_id).cloned()?;
        let state = doc.lock().await;
        state.replica.get(path).cloned()
    }

    /// Full field snapshot for a document, creating/loading it first so a
    /// fresh subscriber sees persisted state.
    pub async fn get_document_state(
        &self,
        document_id: &str,
    ) -> serde_json::Map<String, serde_json::Value> {
        let doc = self.get_or_create_document(document_id).await;
        let state = doc.lock().await;
        state.replica.snapshot()
    }

    pub async fn get_vector_clock(&self, document_id: &str) -> VectorClock {
        match self.documents.read().await.get(document_id) {
            Some(doc) => doc.lock().await.clock.clone(),
            None => VectorClock::new(),
        }
    }

    /// Pointwise-max merge of a client-reported clock into the server clock.
    pub async fn merge_vector_clock(&self, document_id: &str, client_clock: &VectorClock) {
        let doc = self.get_or_create_document(document_id).await;
        doc.lock().await.clock.merge(client_clock);
    }

    /// Idempotent subscriber registration.
    pub async fn subscribe(&self, document_id: &str, connection_id: &str) {
        let doc = self.get_or_create_document(document_id).await;
        doc.lock().await.subscribers.insert(connection_id.to_string());
    }

    /// Idempotent subscriber removal; unknown documents are a no-op.
    pub async fn unsubscribe(&self, document_id: &str, connection_id: &str) {
        if let Some(doc) = self.documents.read().await.get(document_id).cloned() {
            doc.lock().await.subscribers.remove(connection_id);
        }
    }

    /// Remove a closed connection from every document's subscriber set.
    pub async fn unsubscribe_all(&self, connection_id: &str) {
        let docs: Vec<_> = self.documents.read().await.values().cloned().collect();
        for doc in docs {
            doc.lock().await.subscribers.remove(connection_id);
        }
    }

    /// Snapshot copy of a document's subscriber ids.
    pub async fn get_subscribers(&self, document_id: &str) -> Vec<ConnectionId> {
        match self.documents.read().await.get(document_id) {
            Some(doc) => doc.lock().await.subscribers.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Number of documents currently resident in memory.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;

    fn value(v: serde_json::Value) -> FieldValue {
        FieldValue::from_wire(v)
    }

    #[tokio::test]
    async fn writes_tick_the_writer_entry_only() {
        let coordinator = SyncCoordinator::new(None);
        coordinator
            .set_field("d1", "x", value(json!(1)), "c1", Some(1000))
            .await;
        coordinator
            .set_field("d1", "y", value(json!(2)), "c1", Some(1001))
            .await;
        coordinator
            .set_field("d1", "z", value(json!(3)), "c2", Some(1002))
            .await;

        let clock = coordinator.get_vector_clock("d1").await;
        assert_eq!(clock.get("c1"), 2);
        assert_eq!(clock.get("c2"), 1);
    }

    #[tokio::test]
    async fn delete_returns_none_when_it_wins() {
        let coordinator = SyncCoordinator::new(None);
        coordinator
            .set_field("d1", "x", value(json!("v")), "c1", Some(1000))
            .await;
        let authoritative = coordinator.delete_field("d1", "x", "c2", Some(2000)).await;
        assert_eq!(authoritative, None);
        assert_eq!(coordinator.get_field("d1", "x").await, None);
    }

    #[tokio::test]
    async fn stale_write_echoes_the_surviving_value() {
        let coordinator = SyncCoordinator::new(None);
        coordinator
            .set_field("d1", "x", value(json!("winner")), "c1", Some(2000))
            .await;
        let authoritative = coordinator
            .set_field("d1", "x", value(json!("loser")), "c2", Some(1000))
            .await;
        assert_eq!(authoritative, Some(json!("winner")));
    }

    #[tokio::test]
    async fn subscription_is_idempotent_set_membership() {
        let coordinator = SyncCoordinator::new(None);
        coordinator.subscribe("d1", "conn-1").await;
        coordinator.subscribe("d1", "conn-1").await;
        coordinator.subscribe("d1", "conn-2").await;
        let mut subscribers = coordinator.get_subscribers("d1").await;
        subscribers.sort();
        assert_eq!(subscribers, vec!["conn-1".to_string(), "conn-2".to_string()]);

        coordinator.unsubscribe("d1", "conn-1").await;
        coordinator.unsubscribe("d1", "conn-1").await;
        assert_eq!(coordinator.get_subscribers("d1").await, vec!["conn-2".to_string()]);

        // Unknown document: no-op, no creation.
        coordinator.unsubscribe("ghost", "conn-1").await;
        assert_eq!(coordinator.document_count().await, 1);
    }

    #[tokio::test]
    async fn close_unhooks_every_document() {
        let coordinator = SyncCoordinator::new(None);
        coordinator.subscribe("d1", "conn-1").await;
        coordinator.subscribe("d2", "conn-1").await;
        coordinator.subscribe("d2", "conn-2").await;
        coordinator.unsubscribe_all("conn-1").await;
        assert!(coordinator.get_subscribers("d1").await.is_empty());
        assert_eq!(coordinator.get_subscribers("d2").await, vec!["conn-2".to_string()]);
    }

    #[tokio::test]
    async fn merge_takes_whole_reported_clock() {
        let coordinator = SyncCoordinator::new(None);
        let reported: VectorClock = [("c1".to_string(), 4), ("c2".to_string(), 2)]
            .into_iter()
            .collect();
        coordinator.merge_vector_clock("d1", &reported).await;
        coordinator
            .set_field("d1", "x", value(json!(1)), "c1", Some(1000))
            .await;

        let clock = coordinator.get_vector_clock("d1").await;
        assert_eq!(clock.get("c1"), 5);
        assert_eq!(clock.get("c2"), 2);
    }

    #[tokio::test]
    async fn state_survives_restart_through_storage() {
        let storage = Arc::new(MemoryStorage::new());

        {
            let coordinator = SyncCoordinator::new(Some(storage.clone()));
            coordinator
                .set_field("d1", "title", value(json!("persisted")), "c1", Some(1000))
                .await;
        }

        // A new coordinator simulates a restarted server process.
        let coordinator = SyncCoordinator::new(Some(storage.clone()));
        let state = coordinator.get_document_state("d1").await;
        assert_eq!(state.get("title"), Some(&json!("persisted")));
        let clock = coordinator.get_vector_clock("d1").await;
        assert_eq!(clock.get("c1"), 1);
        assert_eq!(storage.delta_count().await, 1);
    }

    struct FailingStorage;

    #[async_trait]
    impl StorageAdapter for FailingStorage {
        async fn get_document(&self, _: &str) -> anyhow::Result<Option<crate::StoredDocument>> {
            Err(anyhow!("backend down"))
        }
        async fn save_document(
            &self,
            _: &str,
            _: &serde_json::Map<String, serde_json::Value>,
        ) -> anyhow::Result<()> {
            Err(anyhow!("backend down"))
        }
        async fn get_vector_clock(&self, _: &str) -> anyhow::Result<VectorClock> {
            Err(anyhow!("backend down"))
        }
        async fn update_vector_clock(&self, _: &str, _: &str, _: u64) -> anyhow::Result<()> {
            Err(anyhow!("backend down"))
        }
        async fn save_delta(&self, _: &AuditDelta) -> anyhow::Result<()> {
            Err(anyhow!("backend down"))
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn storage_failures_never_fail_operations() {
        let coordinator = SyncCoordinator::new(Some(Arc::new(FailingStorage)));
        let authoritative = coordinator
            .set_field("d1", "x", value(json!(1)), "c1", Some(1000))
            .await;
        assert_eq!(authoritative, Some(json!(1)));
        assert_eq!(coordinator.get_field("d1", "x").await, Some(json!(1)));
    }
}
