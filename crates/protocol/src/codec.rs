use thiserror::Error;

use crate::frames::Frame;

/// Frame types the parser accepts. Anything else fails closed.
const KNOWN_TYPES: &[&str] = &[
    "auth",
    "auth_success",
    "auth_error",
    "sync_request",
    "sync_response",
    "delta",
    "ack",
    "ping",
    "pong",
    "error",
];

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

/// Parse one wire frame, failing closed.
///
/// The envelope fields `type`, `id`, and `timestamp` are checked before the
/// typed decode so a missing envelope or unknown type reports precisely,
/// rather than as an opaque serde error.
pub fn parse_frame(text: &str) -> Result<Frame, FrameError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    let object = value
        .as_object()
        .ok_or_else(|| FrameError::Malformed("frame is not an object".into()))?;

    let frame_type = object
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| FrameError::Malformed("missing field: type".into()))?;
    if !KNOWN_TYPES.contains(&frame_type) {
        return Err(FrameError::UnknownType(frame_type.to_string()));
    }

    if !object.get("id").is_some_and(serde_json::Value::is_string) {
        return Err(FrameError::Malformed("missing field: id".into()));
    }
    if !object.get("timestamp").is_some_and(serde_json::Value::is_u64) {
        return Err(FrameError::Malformed("missing field: timestamp".into()));
    }

    serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_delta_frame() {
        let text = json!({
            "type": "delta",
            "id": "f-1",
            "timestamp": 1000,
            "documentId": "doc-1",
            "delta": { "title": "hello", "gone": { "__deleted": true } },
            "vectorClock": { "c1": 3 }
        })
        .to_string();

        let frame = parse_frame(&text).ok();
        let Some(Frame::Delta {
            document_id,
            delta,
            vector_clock,
            ..
        }) = frame
        else {
            panic!("expected delta frame");
        };
        assert_eq!(document_id, "doc-1");
        assert_eq!(delta.len(), 2);
        assert!(delta.get("gone").is_some_and(|v| v.is_tombstone()));
        assert_eq!(vector_clock.get("c1"), 3);
    }

    #[test]
    fn round_trips_through_encode() {
        let frame = Frame::ack("m-42");
        let parsed = parse_frame(&frame.encode()).ok();
        assert_eq!(parsed, Some(frame));
    }

    #[test]
    fn rejects_missing_envelope_fields() {
        for text in [
            json!({"id": "x", "timestamp": 1}).to_string(),
            json!({"type": "ping", "timestamp": 1}).to_string(),
            json!({"type": "ping", "id": "x"}).to_string(),
            json!({"type": "ping", "id": "x", "timestamp": "not-a-number"}).to_string(),
        ] {
            assert!(matches!(parse_frame(&text), Err(FrameError::Malformed(_))));
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let text = json!({"type": "warp", "id": "x", "timestamp": 1}).to_string();
        assert!(matches!(parse_frame(&text), Err(FrameError::UnknownType(t)) if t == "warp"));
    }

    #[test]
    fn rejects_non_json_input() {
        assert!(matches!(parse_frame("not json"), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let frame = Frame::sync_response("r-1", "doc-1", serde_json::Map::new());
        let value: serde_json::Value = serde_json::from_str(&frame.encode()).unwrap_or_default();
        assert_eq!(value["type"], "sync_response");
        assert!(value.get("requestId").is_some());
        assert!(value.get("documentId").is_some());
        assert!(value.get("deltas").is_some_and(|d| d.as_array().is_some_and(Vec::is_empty)));
    }
}
