//! JSON wire codec for messages crossing a process boundary.
//!
//! Routing fields and every header travel as string attributes; the payload
//! travels as JSON text in `data`. Decoding is the exact inverse of encoding.

use chrono::{DateTime, SecondsFormat, Utc};
use concord_core::{AgentMessage, BusError, ConcordResult, MessageId, MessageType, Payload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ATTR_MESSAGE_ID: &str = "message_id";
pub const ATTR_FROM: &str = "from_agent";
pub const ATTR_TO: &str = "to_agent";
pub const ATTR_TYPE: &str = "type";
pub const ATTR_TOPIC: &str = "topic";
pub const ATTR_TIMESTAMP: &str = "timestamp";

/// Attribute names reserved for routing fields. Headers with these names are
/// overwritten on encode.
pub const RESERVED_ATTRIBUTES: [&str; 6] = [
    ATTR_MESSAGE_ID,
    ATTR_FROM,
    ATTR_TO,
    ATTR_TYPE,
    ATTR_TOPIC,
    ATTR_TIMESTAMP,
];

/// A message as published on the distributed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub attributes: BTreeMap<String, String>,
    pub data: String,
}

impl WireEnvelope {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Envelope as JSON bytes, for transports that carry opaque frames.
    pub fn to_bytes(&self) -> ConcordResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(codec_error)
    }

    pub fn from_bytes(bytes: &[u8]) -> ConcordResult<Self> {
        serde_json::from_slice(bytes).map_err(codec_error)
    }
}

fn codec_error(e: serde_json::Error) -> concord_core::ConcordError {
    BusError::Codec {
        reason: e.to_string(),
    }
    .into()
}

/// Size in bytes of the JSON-encoded payload.
pub fn payload_size(payload: &Payload) -> ConcordResult<usize> {
    serde_json::to_vec(payload)
        .map(|bytes| bytes.len())
        .map_err(codec_error)
}

pub fn encode(message: &AgentMessage) -> ConcordResult<WireEnvelope> {
    let mut attributes = message.headers.clone();
    attributes.insert(ATTR_MESSAGE_ID.into(), message.id.to_string());
    attributes.insert(ATTR_FROM.into(), message.from.clone());
    attributes.insert(ATTR_TO.into(), message.to.clone());
    attributes.insert(ATTR_TYPE.into(), message.message_type.as_wire_str().into());
    attributes.insert(ATTR_TOPIC.into(), message.topic.clone());
    attributes.insert(
        ATTR_TIMESTAMP.into(),
        message.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
    );
    let data = serde_json::to_string(&message.payload).map_err(codec_error)?;
    Ok(WireEnvelope { attributes, data })
}

fn required<'a>(envelope: &'a WireEnvelope, key: &str) -> ConcordResult<&'a str> {
    envelope
        .attribute(key)
        .ok_or_else(|| BusError::MissingRoutingField { field: key.to_string() }.into())
}

pub fn decode(envelope: &WireEnvelope) -> ConcordResult<AgentMessage> {
    let required = |key: &str| required(envelope, key);

    let id: MessageId = required(ATTR_MESSAGE_ID)?
        .parse()
        .map_err(|e: uuid::Error| BusError::Codec {
            reason: format!("invalid message_id: {e}"),
        })?;
    let message_type =
        MessageType::from_wire_str(required(ATTR_TYPE)?).map_err(|e| BusError::Codec {
            reason: e.to_string(),
        })?;
    let created_at = DateTime::parse_from_rfc3339(required(ATTR_TIMESTAMP)?)
        .map_err(|e| BusError::Codec {
            reason: format!("invalid timestamp: {e}"),
        })?
        .with_timezone(&Utc);
    let payload: Payload = serde_json::from_str(&envelope.data).map_err(codec_error)?;

    let headers = envelope
        .attributes
        .iter()
        .filter(|(k, _)| !RESERVED_ATTRIBUTES.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(AgentMessage {
        id,
        from: required(ATTR_FROM)?.to_string(),
        to: required(ATTR_TO)?.to_string(),
        message_type,
        topic: required(ATTR_TOPIC)?.to_string(),
        payload,
        headers,
        created_at,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{ConcordError, HEADER_PRIORITY};
    use serde_json::json;

    fn sample() -> AgentMessage {
        AgentMessage::builder("planner", "coder", MessageType::Request, "task.code")
            .with_field("content", "write a parser")
            .with_field("nested", json!({"depth": [1, 2, 3], "ok": true}))
            .with_priority(8)
            .with_header("trace", "abc")
            .build()
    }

    #[test]
    fn test_encode_sets_wire_attributes() {
        let message = sample();
        let envelope = encode(&message).unwrap();
        assert_eq!(envelope.attribute(ATTR_FROM), Some("planner"));
        assert_eq!(envelope.attribute(ATTR_TO), Some("coder"));
        assert_eq!(envelope.attribute(ATTR_TYPE), Some("REQUEST"));
        assert_eq!(envelope.attribute(ATTR_TOPIC), Some("task.code"));
        assert_eq!(envelope.attribute(HEADER_PRIORITY), Some("8"));
        assert_eq!(envelope.attribute("trace"), Some("abc"));
        assert!(envelope.data.contains("write a parser"));
    }

    #[test]
    fn test_decode_inverts_encode() {
        let message = sample();
        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let envelope = encode(&sample()).unwrap();
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(WireEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_missing_attribute_is_rejected() {
        let mut envelope = encode(&sample()).unwrap();
        envelope.attributes.remove(ATTR_TOPIC);
        let err = decode(&envelope).unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Bus(BusError::MissingRoutingField { ref field }) if field == "topic"
        ));
    }

    #[test]
    fn test_bad_payload_is_codec_error() {
        let mut envelope = encode(&sample()).unwrap();
        envelope.data = "{not json".into();
        assert!(matches!(
            decode(&envelope),
            Err(ConcordError::Bus(BusError::Codec { .. }))
        ));
    }

    #[test]
    fn test_payload_size() {
        let mut payload = Payload::new();
        payload.insert("k".into(), json!("v"));
        assert_eq!(payload_size(&payload).unwrap(), r#"{"k":"v"}"#.len());
    }
}
