use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use cosync_common::types::ClientId;

/// Per-client logical counters for one document.
///
/// Entries are monotone non-decreasing: `tick` increments the writer's own
/// entry, `merge` takes the pointwise max of two clocks. Serializes as a
/// plain `{clientId: counter}` JSON map, which is the wire form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<ClientId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment this client's counter and return the new value.
    pub fn tick(&mut self, client_id: &str) -> u64 {
        let entry = self.entries.entry(client_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Current counter for a client, zero if never seen.
    pub fn get(&self, client_id: &str) -> u64 {
        self.entries.get(client_id).copied().unwrap_or(0)
    }

    /// Pointwise max with another clock. Never decreases any entry.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client_id, &counter) in &other.entries {
            self.observe(client_id, counter);
        }
    }

    /// Raise one entry to `counter` if it is higher than the current value.
    pub fn observe(&mut self, client_id: &str, counter: u64) {
        let entry = self.entries.entry(client_id.to_string()).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    pub fn entries(&self) -> &BTreeMap<ClientId, u64> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(ClientId, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (ClientId, u64)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_increments_and_returns() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.tick("a"), 1);
        assert_eq!(clock.tick("a"), 2);
        assert_eq!(clock.tick("b"), 1);
        assert_eq!(clock.get("a"), 2);
        assert_eq!(clock.get("missing"), 0);
    }

    #[test]
    fn merge_takes_pointwise_max() {
        let mut left: VectorClock = [("a".to_string(), 3), ("b".to_string(), 1)]
            .into_iter()
            .collect();
        let right: VectorClock = [("b".to_string(), 5), ("c".to_string(), 2)]
            .into_iter()
            .collect();
        left.merge(&right);
        assert_eq!(left.get("a"), 3);
        assert_eq!(left.get("b"), 5);
        assert_eq!(left.get("c"), 2);
    }

    #[test]
    fn observe_never_decreases() {
        let mut clock = VectorClock::new();
        clock.observe("a", 7);
        clock.observe("a", 3);
        assert_eq!(clock.get("a"), 7);
    }

    #[test]
    fn wire_form_is_a_plain_map() {
        let clock: VectorClock = [("a".to_string(), 2)].into_iter().collect();
        let json = serde_json::to_value(&clock).ok();
        assert_eq!(json, Some(serde_json::json!({"a": 2})));
    }
}
