//! Wire protocol for the cosync gateway: frame types, the JSON codec, the
//! permission model carried in `auth_success`, and the protocol constants
//! shared by server and client.

pub mod codec;
pub mod frames;
pub mod permissions;

pub use codec::{parse_frame, FrameError};
pub use frames::Frame;
pub use permissions::{Access, Permissions};

/// Coalescing window for outbound deltas, per document.
pub const BATCH_INTERVAL_MS: u64 = 50;

/// How long the server waits for a delta ACK before resending.
pub const ACK_TIMEOUT_MS: u64 = 3_000;

/// Resend attempts per `(connection, message)` before declaring the delta
/// lost for that subscriber.
pub const MAX_RETRIES: u32 = 3;

/// Server-side WebSocket ping cadence; one missed pong terminates.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// How long a fresh connection may sit unauthenticated before being closed.
pub const AUTH_TIMEOUT_MS: u64 = 10_000;

/// Client-side bound on one `sync_request` round trip.
pub const SYNC_TIMEOUT_MS: u64 = 10_000;

/// Client subscription retries and backoff base (100 ms × 2ⁿ).
pub const SYNC_MAX_RETRIES: u32 = 3;
pub const SYNC_RETRY_BASE_MS: u64 = 100;

/// Malformed frames tolerated per connection before it is dropped.
pub const MALFORMED_FRAME_LIMIT: u32 = 10;

/// WebSocket close codes used by the gateway.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Auth failure or capacity rejection.
    pub const POLICY: u16 = 1008;
}

/// Fresh frame / message identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
