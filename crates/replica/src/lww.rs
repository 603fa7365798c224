use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cosync_common::types::{ClientId, FieldPath};

use crate::value::FieldValue;

/// Total order deciding which of two writes to the same field survives.
///
/// Derived `Ord` compares fields in declaration order: higher `write_ts`
/// wins, then higher `counter`, then lexicographically greater `client_id`.
/// An incoming write is applied iff its stamp is strictly greater than the
/// stored one, so replaying an identical write is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteStamp {
    pub write_ts: u64,
    pub counter: u64,
    pub client_id: ClientId,
}

/// One field's current value together with the stamp of the write that
/// produced it. Tombstones are never stored; a winning delete removes the
/// record outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub value: serde_json::Value,
    #[serde(flatten)]
    pub stamp: WriteStamp,
}

/// Last-writer-wins field map for a single document.
#[derive(Debug, Clone, Default)]
pub struct DocumentReplica {
    fields: HashMap<FieldPath, FieldRecord>,
}

impl DocumentReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a write and return the authoritative value for the field after
    /// the decision: the incoming value if it won, the existing value if it
    /// lost, `None` if the field ended up deleted or was never present.
    ///
    /// The server echoes this return to all subscribers, which is how a
    /// sender observes the resolution of a concurrent write it lost.
    pub fn set_field(
        &mut self,
        path: &str,
        value: FieldValue,
        counter: u64,
        client_id: &str,
        write_ts: u64,
    ) -> Option<serde_json::Value> {
        let incoming = WriteStamp {
            write_ts,
            counter,
            client_id: client_id.to_string(),
        };

        if let Some(existing) = self.fields.get(path) {
            if incoming <= existing.stamp {
                return Some(existing.value.clone());
            }
        }

        match value {
            FieldValue::Tombstone => {
                self.fields.remove(path);
                None
            }
            FieldValue::Value(v) => {
                self.fields.insert(
                    path.to_string(),
                    FieldRecord {
                        value: v.clone(),
                        stamp: incoming,
                    },
                );
                Some(v)
            }
        }
    }

    /// Delete a field via a tombstone write. Returns `None` when the delete
    /// won (field erased) and the surviving value when it lost.
    pub fn delete_field(
        &mut self,
        path: &str,
        counter: u64,
        client_id: &str,
        write_ts: u64,
    ) -> Option<serde_json::Value> {
        self.set_field(path, FieldValue::Tombstone, counter, client_id, write_ts)
    }

    pub fn get(&self, path: &str) -> Option<&serde_json::Value> {
        self.fields.get(path).map(|r| &r.value)
    }

    pub fn record(&self, path: &str) -> Option<&FieldRecord> {
        self.fields.get(path)
    }

    /// Current field map with no replication metadata. Tombstones are never
    /// stored, so nothing needs stripping beyond dropping the stamps.
    pub fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        self.fields
            .iter()
            .map(|(path, record)| (path.clone(), record.value.clone()))
            .collect()
    }

    /// Seed a field from persisted state. Restored records carry a zero
    /// stamp so any live write outranks them.
    pub fn restore_field(&mut self, path: &str, value: serde_json::Value) {
        self.fields.insert(
            path.to_string(),
            FieldRecord {
                value,
                stamp: WriteStamp {
                    write_ts: 0,
                    counter: 0,
                    client_id: String::new(),
                },
            },
        );
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(
        replica: &mut DocumentReplica,
        path: &str,
        value: serde_json::Value,
        counter: u64,
        client_id: &str,
        write_ts: u64,
    ) -> Option<serde_json::Value> {
        replica.set_field(path, FieldValue::from_wire(value), counter, client_id, write_ts)
    }

    #[test]
    fn first_write_is_stored() {
        let mut replica = DocumentReplica::new();
        let authoritative = set(&mut replica, "x", json!(1), 1, "a", 1000);
        assert_eq!(authoritative, Some(json!(1)));
        assert_eq!(replica.get("x"), Some(&json!(1)));
    }

    #[test]
    fn higher_timestamp_wins() {
        let mut replica = DocumentReplica::new();
        set(&mut replica, "x", json!("old"), 1, "a", 1000);
        let authoritative = set(&mut replica, "x", json!("new"), 1, "b", 2000);
        assert_eq!(authoritative, Some(json!("new")));

        // Stale write loses and the survivor is echoed back.
        let authoritative = set(&mut replica, "x", json!("stale"), 5, "c", 1500);
        assert_eq!(authoritative, Some(json!("new")));
    }

    #[test]
    fn timestamp_tie_falls_to_counter_then_client_id() {
        let mut replica = DocumentReplica::new();
        set(&mut replica, "x", json!("low"), 1, "a", 1000);
        assert_eq!(set(&mut replica, "x", json!("high"), 2, "a", 1000), Some(json!("high")));

        // Same ts, same counter: lexicographically greater client id wins.
        let mut replica = DocumentReplica::new();
        set(&mut replica, "x", json!("from-a"), 1, "a", 1000);
        assert_eq!(
            set(&mut replica, "x", json!("from-b"), 1, "b", 1000),
            Some(json!("from-b"))
        );
    }

    #[test]
    fn two_client_tie_break_is_order_independent() {
        // Both clients write at write_ts=1000 after ticking to counter=1;
        // "b" must win at every replica regardless of arrival order.
        let mut forward = DocumentReplica::new();
        set(&mut forward, "x", json!("from-a"), 1, "a", 1000);
        set(&mut forward, "x", json!("from-b"), 1, "b", 1000);

        let mut reverse = DocumentReplica::new();
        set(&mut reverse, "x", json!("from-b"), 1, "b", 1000);
        set(&mut reverse, "x", json!("from-a"), 1, "a", 1000);

        assert_eq!(forward.get("x"), Some(&json!("from-b")));
        assert_eq!(forward.snapshot(), reverse.snapshot());
    }

    #[test]
    fn identical_write_is_idempotent() {
        let mut replica = DocumentReplica::new();
        set(&mut replica, "x", json!(42), 3, "a", 1000);
        let before = replica.snapshot();
        for _ in 0..5 {
            set(&mut replica, "x", json!(42), 3, "a", 1000);
        }
        assert_eq!(replica.snapshot(), before);
    }

    #[test]
    fn winning_tombstone_erases_the_field() {
        let mut replica = DocumentReplica::new();
        set(&mut replica, "x", json!("v"), 1, "a", 1000);
        let authoritative = replica.delete_field("x", 1, "b", 2000);
        assert_eq!(authoritative, None);
        assert_eq!(replica.get("x"), None);
        assert!(replica.snapshot().is_empty());
    }

    #[test]
    fn losing_tombstone_is_dropped() {
        let mut replica = DocumentReplica::new();
        set(&mut replica, "x", json!("keep"), 1, "b", 2000);
        let authoritative = replica.delete_field("x", 1, "a", 1000);
        assert_eq!(authoritative, Some(json!("keep")));
        assert_eq!(replica.get("x"), Some(&json!("keep")));
    }

    #[test]
    fn delete_vs_write_tie_resolves_by_client_id() {
        // a writes, b deletes, same write_ts and counter: b > a, delete wins.
        let mut replica = DocumentReplica::new();
        set(&mut replica, "x", json!("new"), 1, "a", 1005);
        assert_eq!(replica.delete_field("x", 1, "b", 1005), None);
        assert_eq!(replica.get("x"), None);

        // Reversed ids: the write survives the delete.
        let mut replica = DocumentReplica::new();
        set(&mut replica, "x", json!("new"), 1, "b", 1005);
        assert_eq!(replica.delete_field("x", 1, "a", 1005), Some(json!("new")));
        assert_eq!(replica.get("x"), Some(&json!("new")));
    }

    #[test]
    fn any_permutation_of_writes_converges() {
        // Six writes across three clients, applied in several orders; every
        // replica must end in the same state (strong eventual consistency).
        let writes: Vec<(&str, serde_json::Value, u64, &str, u64)> = vec![
            ("x", json!(1), 1, "a", 1000),
            ("x", json!(2), 1, "b", 1000),
            ("y", json!("t"), 2, "a", 1001),
            ("y", json!({ "__deleted": true }), 1, "c", 1001),
            ("z", json!([1, 2]), 2, "b", 999),
            ("x", json!(3), 2, "c", 1000),
        ];

        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2, 3, 4, 5],
            vec![5, 4, 3, 2, 1, 0],
            vec![2, 0, 5, 1, 4, 3],
            vec![1, 1, 0, 5, 3, 2, 4, 0], // with duplicates
        ];

        let mut snapshots = Vec::new();
        for order in orders {
            let mut replica = DocumentReplica::new();
            for idx in order {
                let (path, value, counter, client_id, write_ts) = writes[idx].clone();
                set(&mut replica, path, value, counter, client_id, write_ts);
            }
            snapshots.push(replica.snapshot());
        }
        for snapshot in &snapshots[1..] {
            assert_eq!(snapshot, &snapshots[0]);
        }
    }

    #[test]
    fn snapshot_drops_stamps() {
        let mut replica = DocumentReplica::new();
        set(&mut replica, "a", json!(1), 1, "c1", 1000);
        set(&mut replica, "b", json!("two"), 2, "c1", 1001);
        let snapshot = replica.snapshot();
        assert_eq!(snapshot.get("a"), Some(&json!(1)));
        assert_eq!(snapshot.get("b"), Some(&json!("two")));
        assert_eq!(snapshot.len(), 2);
    }
}
