//! Local-first client replica: an in-process document cache that applies
//! writes immediately, queues them while offline, and reconciles with the
//! gateway over the sync protocol on (re)connect.

pub mod client;
pub mod replica;

pub use client::{ClientConfig, SyncClient};
pub use replica::{ClientReplica, QueuedOp};
