/// Opaque key addressing one replicated document.
pub type DocumentId = String;

/// Top-level key within a document's JSON state.
pub type FieldPath = String;

/// Replica identity used to tag writes and key vector-clock entries.
/// Declared by the client; falls back to the connection id so that two
/// connections never share a clock entry.
pub type ClientId = String;

/// Server-assigned identifier for one WebSocket connection.
pub type ConnectionId = String;

/// Authenticated identity owning zero or more connections.
pub type PrincipalId = String;

/// Identifier carried by every wire frame (`id`) and used to match ACKs
/// against outstanding deltas (`messageId`).
pub type MessageId = String;
