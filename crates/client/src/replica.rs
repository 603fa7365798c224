use std::collections::{HashMap, HashSet, VecDeque};

use cosync_common::time::epoch_millis;
use cosync_common::types::{ClientId, DocumentId, FieldPath};
use cosync_protocol::Frame;
use cosync_replica::{FieldValue, VectorClock};

/// One write performed while offline, replayed in insertion order after the
/// next successful authentication.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedOp {
    Set {
        document_id: DocumentId,
        field: FieldPath,
        value: serde_json::Value,
    },
    Delete {
        document_id: DocumentId,
        field: FieldPath,
    },
}

impl QueuedOp {
    pub fn document_id(&self) -> &str {
        match self {
            QueuedOp::Set { document_id, .. } | QueuedOp::Delete { document_id, .. } => document_id,
        }
    }
}

/// The client's local view: document caches, per-document clocks, the
/// subscription set, and the offline queue. Pure state — the socket side
/// lives in [`crate::client::SyncClient`].
pub struct ClientReplica {
    client_id: ClientId,
    documents: HashMap<DocumentId, serde_json::Map<String, serde_json::Value>>,
    clocks: HashMap<DocumentId, VectorClock>,
    subscribed: HashSet<DocumentId>,
    queue: VecDeque<QueuedOp>,
}

impl ClientReplica {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            documents: HashMap::new(),
            clocks: HashMap::new(),
            subscribed: HashSet::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    // ── Local-first writes ───────────────────────────────────────────────

    /// Apply a field write to the local cache immediately.
    pub fn local_set(&mut self, document_id: &str, field: &str, value: serde_json::Value) {
        self.documents
            .entry(document_id.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    /// Erase a field from the local cache immediately.
    pub fn local_delete(&mut self, document_id: &str, field: &str) {
        if let Some(fields) = self.documents.get_mut(document_id) {
            fields.remove(field);
        }
    }

    /// Build the outbound delta for one field change, ticking this client's
    /// clock entry. The frame timestamp is the write timestamp.
    pub fn make_delta(&mut self, document_id: &str, field: &str, value: FieldValue) -> Frame {
        let clock = self.clocks.entry(document_id.to_string()).or_default();
        clock.tick(&self.client_id);
        Frame::Delta {
            id: cosync_protocol::new_id(),
            timestamp: epoch_millis(),
            document_id: document_id.to_string(),
            delta: [(field.to_string(), value)].into_iter().collect(),
            vector_clock: clock.clone(),
        }
    }

    pub fn make_delta_for_op(&mut self, op: &QueuedOp) -> Frame {
        match op {
            QueuedOp::Set {
                document_id,
                field,
                value,
            } => self.make_delta(
                document_id,
                field,
                FieldValue::Value(value.clone()),
            ),
            QueuedOp::Delete { document_id, field } => {
                self.make_delta(document_id, field, FieldValue::Tombstone)
            }
        }
    }

    // ── Offline queue ────────────────────────────────────────────────────

    pub fn enqueue(&mut self, op: QueuedOp) {
        self.queue.push_back(op);
    }

    pub fn front_op(&self) -> Option<QueuedOp> {
        self.queue.front().cloned()
    }

    pub fn pop_front_op(&mut self) {
        self.queue.pop_front();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // ── Inbound application ──────────────────────────────────────────────

    /// Apply a server delta: tombstones erase, other values overwrite, and
    /// the carried clock merges in. Re-applying the same delta is a no-op.
    pub fn apply_delta(
        &mut self,
        document_id: &str,
        delta: &std::collections::BTreeMap<FieldPath, FieldValue>,
        clock: &VectorClock,
    ) {
        let fields = self.documents.entry(document_id.to_string()).or_default();
        for (field, value) in delta {
            match value {
                FieldValue::Tombstone => {
                    fields.remove(field);
                }
                FieldValue::Value(v) => {
                    fields.insert(field.clone(), v.clone());
                }
            }
        }
        self.clocks
            .entry(document_id.to_string())
            .or_default()
            .merge(clock);
    }

    /// Replace the local document with the server snapshot. The server is
    /// authoritative after reconnection; unsynced local writes are either in
    /// the offline queue or already echoed through the server.
    pub fn apply_snapshot(
        &mut self,
        document_id: &str,
        state: serde_json::Map<String, serde_json::Value>,
    ) {
        self.documents.insert(document_id.to_string(), state);
        self.subscribed.insert(document_id.to_string());
    }

    // ── Reads & subscription bookkeeping ─────────────────────────────────

    pub fn snapshot(&self, document_id: &str) -> serde_json::Map<String, serde_json::Value> {
        self.documents.get(document_id).cloned().unwrap_or_default()
    }

    pub fn get_field(&self, document_id: &str, field: &str) -> Option<serde_json::Value> {
        self.documents
            .get(document_id)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    pub fn clock(&self, document_id: &str) -> VectorClock {
        self.clocks.get(document_id).cloned().unwrap_or_default()
    }

    pub fn is_subscribed(&self, document_id: &str) -> bool {
        self.subscribed.contains(document_id)
    }

    /// Forget every subscription so the next access re-issues
    /// `sync_request` against the fresh connection.
    pub fn clear_subscriptions(&mut self) {
        self.subscribed.clear();
    }
}
