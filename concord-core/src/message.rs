//! Bus message types.

use crate::{new_message_id, AgentId, MessageId, Payload, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Address that fans a message out to every subscriber instead of one agent.
pub const BROADCAST_TARGET: &str = "*";

/// Header carrying the id of the REQUEST a RESPONSE answers.
pub const HEADER_CORRELATION_ID: &str = "correlation_id";

/// Header carrying message priority in `1..=10`.
pub const HEADER_PRIORITY: &str = "priority";

/// Header naming the bus instance that published a message onto the
/// distributed channel.
pub const HEADER_BUS_INSTANCE: &str = "bus_instance";

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

// ============================================================================
// MESSAGE TYPE
// ============================================================================

/// Kind of bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum MessageType {
    /// Expects exactly one RESPONSE, correlated by message id
    Request,
    /// Answer to a REQUEST
    Response,
    /// Fan-out to every subscriber of a topic
    Broadcast,
    /// System or domain event
    Event,
    /// Instruction with no reply expected
    Command,
    /// Read-only question with no correlation
    Query,
}

impl MessageType {
    /// Convert to wire string representation.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            MessageType::Request => "REQUEST",
            MessageType::Response => "RESPONSE",
            MessageType::Broadcast => "BROADCAST",
            MessageType::Event => "EVENT",
            MessageType::Command => "COMMAND",
            MessageType::Query => "QUERY",
        }
    }

    /// Parse from wire string representation (case-insensitive).
    pub fn from_wire_str(s: &str) -> Result<Self, MessageTypeParseError> {
        match s.to_ascii_uppercase().as_str() {
            "REQUEST" => Ok(MessageType::Request),
            "RESPONSE" => Ok(MessageType::Response),
            "BROADCAST" => Ok(MessageType::Broadcast),
            "EVENT" => Ok(MessageType::Event),
            "COMMAND" => Ok(MessageType::Command),
            "QUERY" => Ok(MessageType::Query),
            _ => Err(MessageTypeParseError(s.to_string())),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire_str())
    }
}

impl FromStr for MessageType {
    type Err = MessageTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire_str(s)
    }
}

/// Error when parsing an invalid message type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTypeParseError(pub String);

impl fmt::Display for MessageTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid message type: {}", self.0)
    }
}

impl std::error::Error for MessageTypeParseError {}

// ============================================================================
// AGENT MESSAGE
// ============================================================================

/// A message routed by the bus.
///
/// Built once through [`MessageBuilder`]; headers are fixed at build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentMessage {
    pub id: MessageId,
    pub from: AgentId,
    /// Target agent, or [`BROADCAST_TARGET`]
    pub to: AgentId,
    pub message_type: MessageType,
    pub topic: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub payload: Payload,
    pub headers: BTreeMap<String, String>,
    pub created_at: Timestamp,
}

impl AgentMessage {
    /// Start building a message with a fresh id.
    pub fn builder(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        message_type: MessageType,
        topic: impl Into<String>,
    ) -> MessageBuilder {
        MessageBuilder::new(from, to, message_type, topic)
    }

    /// Build a REQUEST addressed to a single agent.
    pub fn request(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        topic: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::builder(from, to, MessageType::Request, topic)
            .with_payload(payload)
            .build()
    }

    /// Build a BROADCAST on a topic.
    pub fn broadcast(from: impl Into<AgentId>, topic: impl Into<String>, payload: Payload) -> Self {
        Self::builder(from, BROADCAST_TARGET, MessageType::Broadcast, topic)
            .with_payload(payload)
            .build()
    }

    /// Look up a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Id of the REQUEST this message answers, if present and well-formed.
    pub fn correlation_id(&self) -> Option<MessageId> {
        self.header(HEADER_CORRELATION_ID)
            .and_then(|s| s.parse().ok())
    }

    /// Message priority, defaulting to [`DEFAULT_PRIORITY`].
    pub fn priority(&self) -> u8 {
        self.header(HEADER_PRIORITY)
            .and_then(|s| s.parse::<u8>().ok())
            .map(|p| p.clamp(MIN_PRIORITY, MAX_PRIORITY))
            .unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_TARGET
    }

    pub fn is_request(&self) -> bool {
        self.message_type == MessageType::Request
    }

    pub fn is_response(&self) -> bool {
        self.message_type == MessageType::Response
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Builder for [`AgentMessage`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: AgentMessage,
}

impl MessageBuilder {
    pub fn new(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        message_type: MessageType,
        topic: impl Into<String>,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_PRIORITY.to_string(), DEFAULT_PRIORITY.to_string());
        Self {
            message: AgentMessage {
                id: new_message_id(),
                from: from.into(),
                to: to.into(),
                message_type,
                topic: topic.into(),
                payload: Payload::new(),
                headers,
                created_at: Utc::now(),
            },
        }
    }

    /// Replace the whole payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.message.payload = payload;
        self
    }

    /// Set a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.message.payload.insert(key.into(), value.into());
        self
    }

    /// Mark this message as the answer to `request_id`.
    pub fn with_correlation_id(self, request_id: MessageId) -> Self {
        self.with_header(HEADER_CORRELATION_ID, request_id.to_string())
    }

    /// Set priority, clamped to `1..=10`.
    pub fn with_priority(self, priority: u8) -> Self {
        let priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self.with_header(HEADER_PRIORITY, priority.to_string())
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.headers.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> AgentMessage {
        self.message
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_wire_roundtrip() {
        for t in [
            MessageType::Request,
            MessageType::Response,
            MessageType::Broadcast,
            MessageType::Event,
            MessageType::Command,
            MessageType::Query,
        ] {
            assert_eq!(MessageType::from_wire_str(t.as_wire_str()), Ok(t));
        }
        assert_eq!("request".parse::<MessageType>(), Ok(MessageType::Request));
        assert!(MessageType::from_wire_str("PING").is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let msg = AgentMessage::builder("a", "b", MessageType::Command, "work").build();
        assert_eq!(msg.from, "a");
        assert_eq!(msg.to, "b");
        assert_eq!(msg.priority(), DEFAULT_PRIORITY);
        assert!(msg.correlation_id().is_none());
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn test_priority_is_clamped() {
        let high = AgentMessage::builder("a", "b", MessageType::Event, "t")
            .with_priority(42)
            .build();
        assert_eq!(high.priority(), MAX_PRIORITY);

        let low = AgentMessage::builder("a", "b", MessageType::Event, "t")
            .with_priority(0)
            .build();
        assert_eq!(low.priority(), MIN_PRIORITY);
    }

    #[test]
    fn test_correlation_header() {
        let req = AgentMessage::request("a", "b", "t", Payload::new());
        let resp = AgentMessage::builder("b", "a", MessageType::Response, "t")
            .with_correlation_id(req.id)
            .with_field("ok", json!(true))
            .build();
        assert_eq!(resp.correlation_id(), Some(req.id));
        assert!(resp.is_response());
        assert_eq!(resp.payload.get("ok"), Some(&json!(true)));
    }

    #[test]
    fn test_broadcast_constructor() {
        let msg = AgentMessage::broadcast("system", "topic.x", Payload::new());
        assert!(msg.is_broadcast());
        assert_eq!(msg.message_type, MessageType::Broadcast);
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&MessageType::Broadcast).unwrap();
        assert_eq!(json, "\"BROADCAST\"");
    }
}
