use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use cosync_common::time::epoch_millis;
use cosync_common::types::{DocumentId, FieldPath, MessageId};
use cosync_replica::{FieldValue, VectorClock};

use crate::permissions::Permissions;
use crate::new_id;

/// A protocol frame. JSON text over the WebSocket, tagged by `type`; every
/// frame carries `id` and `timestamp` (epoch millis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// C→S: authenticate with a bearer token and/or API key.
    Auth {
        id: String,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        /// Replica identity for vector-clock entries; the connection id is
        /// used when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    /// S→C: authentication accepted.
    AuthSuccess {
        id: String,
        timestamp: u64,
        user_id: String,
        permissions: Permissions,
    },
    /// S→C: authentication rejected; the connection closes with 1008.
    AuthError {
        id: String,
        timestamp: u64,
        error: String,
    },
    /// C→S: subscribe to a document and request its full state.
    SyncRequest {
        id: String,
        timestamp: u64,
        document_id: DocumentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vector_clock: Option<VectorClock>,
    },
    /// S→C: full snapshot reply to a `sync_request`.
    SyncResponse {
        id: String,
        timestamp: u64,
        request_id: String,
        document_id: DocumentId,
        state: serde_json::Map<String, serde_json::Value>,
        /// Always empty: the snapshot is the contract.
        deltas: Vec<serde_json::Value>,
    },
    /// Both directions: a batch of field changes for one document. Values
    /// may be the tombstone sentinel `{"__deleted": true}`.
    Delta {
        id: String,
        timestamp: u64,
        document_id: DocumentId,
        delta: BTreeMap<FieldPath, FieldValue>,
        vector_clock: VectorClock,
    },
    /// C→S (S→C tolerated): acknowledge receipt of a delta by message id.
    Ack {
        id: String,
        timestamp: u64,
        message_id: MessageId,
    },
    /// Application-level liveness probe.
    Ping { id: String, timestamp: u64 },
    Pong { id: String, timestamp: u64 },
    /// S→C: protocol or permission error; the connection stays open.
    Error {
        id: String,
        timestamp: u64,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl Frame {
    /// The frame's own id.
    pub fn id(&self) -> &str {
        match self {
            Frame::Auth { id, .. }
            | Frame::AuthSuccess { id, .. }
            | Frame::AuthError { id, .. }
            | Frame::SyncRequest { id, .. }
            | Frame::SyncResponse { id, .. }
            | Frame::Delta { id, .. }
            | Frame::Ack { id, .. }
            | Frame::Ping { id, .. }
            | Frame::Pong { id, .. }
            | Frame::Error { id, .. } => id,
        }
    }

    /// Serialize for the wire. Frame serialization has no fallible parts;
    /// a serializer error degrades to an empty string rather than a panic.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn error(error: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Frame::Error {
            id: new_id(),
            timestamp: epoch_millis(),
            error: error.into(),
            details,
        }
    }

    pub fn auth_error(error: impl Into<String>) -> Self {
        Frame::AuthError {
            id: new_id(),
            timestamp: epoch_millis(),
            error: error.into(),
        }
    }

    pub fn auth_success(user_id: impl Into<String>, permissions: Permissions) -> Self {
        Frame::AuthSuccess {
            id: new_id(),
            timestamp: epoch_millis(),
            user_id: user_id.into(),
            permissions,
        }
    }

    pub fn ack(message_id: impl Into<String>) -> Self {
        Frame::Ack {
            id: new_id(),
            timestamp: epoch_millis(),
            message_id: message_id.into(),
        }
    }

    pub fn ping() -> Self {
        Frame::Ping {
            id: new_id(),
            timestamp: epoch_millis(),
        }
    }

    pub fn pong() -> Self {
        Frame::Pong {
            id: new_id(),
            timestamp: epoch_millis(),
        }
    }

    pub fn sync_response(
        request_id: impl Into<String>,
        document_id: impl Into<String>,
        state: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Frame::SyncResponse {
            id: new_id(),
            timestamp: epoch_millis(),
            request_id: request_id.into(),
            document_id: document_id.into(),
            state,
            deltas: Vec::new(),
        }
    }

    pub fn delta(
        document_id: impl Into<String>,
        delta: BTreeMap<FieldPath, FieldValue>,
        vector_clock: VectorClock,
    ) -> Self {
        Frame::Delta {
            id: new_id(),
            timestamp: epoch_millis(),
            document_id: document_id.into(),
            delta,
            vector_clock,
        }
    }
}
