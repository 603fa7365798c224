use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire key marking a field value as a deletion.
pub const TOMBSTONE_KEY: &str = "__deleted";

/// A field value in transit: either a real JSON value or a tombstone.
///
/// On the wire a tombstone is the sentinel object `{"__deleted": true}`;
/// internally it is a distinct variant so a genuine object carrying that key
/// can never be confused with a deletion after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Tombstone,
    Value(serde_json::Value),
}

impl FieldValue {
    /// Decode a raw wire value, recognizing the tombstone sentinel.
    pub fn from_wire(value: serde_json::Value) -> Self {
        if is_tombstone(&value) {
            FieldValue::Tombstone
        } else {
            FieldValue::Value(value)
        }
    }

    /// Encode back to the wire representation.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            FieldValue::Tombstone => tombstone(),
            FieldValue::Value(v) => v.clone(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, FieldValue::Tombstone)
    }

    /// The inner JSON value, `None` for tombstones.
    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            FieldValue::Tombstone => None,
            FieldValue::Value(v) => Some(v),
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        FieldValue::from_wire(value)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(FieldValue::from_wire(serde_json::Value::deserialize(
            deserializer,
        )?))
    }
}

/// The wire sentinel object.
pub fn tombstone() -> serde_json::Value {
    serde_json::json!({ TOMBSTONE_KEY: true })
}

/// True when a raw JSON value is the deletion sentinel.
pub fn is_tombstone(value: &serde_json::Value) -> bool {
    value
        .as_object()
        .and_then(|m| m.get(TOMBSTONE_KEY))
        .and_then(serde_json::Value::as_bool)
        == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_round_trip() {
        let fv = FieldValue::from_wire(tombstone());
        assert!(fv.is_tombstone());
        assert_eq!(fv.to_wire(), tombstone());
    }

    #[test]
    fn plain_values_pass_through() {
        let fv = FieldValue::from_wire(serde_json::json!({"title": "notes"}));
        assert!(!fv.is_tombstone());
        assert_eq!(
            fv.into_value(),
            Some(serde_json::json!({"title": "notes"}))
        );
    }

    #[test]
    fn deleted_false_is_not_a_tombstone() {
        let fv = FieldValue::from_wire(serde_json::json!({ TOMBSTONE_KEY: false }));
        assert!(!fv.is_tombstone());
    }
}
