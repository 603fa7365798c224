//! Server-side replication engine: the per-document sync coordinator, the
//! batching + ACK-tracked delivery layer, and the optional storage and
//! pub/sub collaborator hooks.

pub mod coordinator;
pub mod delivery;
pub mod pubsub;
pub mod storage;

pub use coordinator::SyncCoordinator;
pub use delivery::{DeliveryConfig, DeliveryLayer, DeliverySink};
pub use pubsub::{NoopPubSub, PubSubAdapter};
pub use storage::{
    AuditDelta, MemoryStorage, OperationKind, SqliteStorage, StorageAdapter, StoredDocument,
};
