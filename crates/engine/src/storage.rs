use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use cosync_common::time::epoch_millis;
use cosync_common::types::{ClientId, DocumentId, FieldPath};
use cosync_replica::VectorClock;

pub mod sqlite;

pub use sqlite::SqliteStorage;

/// A persisted document snapshot.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Set,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Set => "set",
            OperationKind::Delete => "delete",
        }
    }
}

/// One accepted write, recorded as an audit trail entry.
#[derive(Debug, Clone)]
pub struct AuditDelta {
    pub document_id: DocumentId,
    pub client_id: ClientId,
    pub operation: OperationKind,
    pub field_path: FieldPath,
    pub value: Option<serde_json::Value>,
    pub clock_value: u64,
}

/// Optional persistence collaborator consumed by the coordinator.
///
/// Every method is best-effort from the coordinator's point of view:
/// failures are logged and swallowed, and in-memory state stays the source
/// of truth for the lifetime of the process.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get_document(&self, document_id: &str) -> Result<Option<StoredDocument>>;

    async fn save_document(
        &self,
        document_id: &str,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;

    async fn get_vector_clock(&self, document_id: &str) -> Result<VectorClock>;

    async fn update_vector_clock(
        &self,
        document_id: &str,
        client_id: &str,
        counter: u64,
    ) -> Result<()>;

    async fn save_delta(&self, delta: &AuditDelta) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

// ── In-memory adapter ────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<DocumentId, StoredDocument>,
    clocks: HashMap<DocumentId, VectorClock>,
    deltas: Vec<AuditDelta>,
}

/// Map-backed storage adapter for tests and single-process deployments that
/// want restart recovery disabled.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded audit deltas.
    pub async fn delta_count(&self) -> usize {
        self.inner.lock().await.deltas.len()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get_document(&self, document_id: &str) -> Result<Option<StoredDocument>> {
        Ok(self.inner.lock().await.documents.get(document_id).cloned())
    }

    async fn save_document(
        &self,
        document_id: &str,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.inner.lock().await.documents.insert(
            document_id.to_string(),
            StoredDocument {
                fields: fields.clone(),
                updated_at: epoch_millis(),
            },
        );
        Ok(())
    }

    async fn get_vector_clock(&self, document_id: &str) -> Result<VectorClock> {
        Ok(self
            .inner
            .lock()
            .await
            .clocks
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_vector_clock(
        &self,
        document_id: &str,
        client_id: &str,
        counter: u64,
    ) -> Result<()> {
        self.inner
            .lock()
            .await
            .clocks
            .entry(document_id.to_string())
            .or_default()
            .observe(client_id, counter);
        Ok(())
    }

    async fn save_delta(&self, delta: &AuditDelta) -> Result<()> {
        self.inner.lock().await.deltas.push(delta.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
