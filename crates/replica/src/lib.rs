//! Per-document replication primitives: vector clocks, tombstone-aware
//! field values, and the last-writer-wins replica.
//!
//! Convergence rests on one rule: for a given field, the stored
//! `(write_ts, counter, client_id)` triple is the maximum of every write the
//! replica has observed, under the total order defined by [`WriteStamp`].
//! Because the order is total and deterministic, any two replicas that have
//! seen the same set of writes hold the same state, regardless of delivery
//! order or duplication.

pub mod clock;
pub mod lww;
pub mod value;

pub use clock::VectorClock;
pub use lww::{DocumentReplica, FieldRecord, WriteStamp};
pub use value::FieldValue;
