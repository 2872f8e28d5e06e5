//! Payload shapes exchanged between the orchestrator and agent workers.

use concord_core::{AgentMessage, AgentResponse, BusError, ConcordResult, Payload};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Topic of task REQUESTs sent by the orchestrator.
pub const TOPIC_TASK: &str = "orchestrator.task";

/// Payload field carrying a note on a shared topic.
pub const FIELD_NOTE: &str = "note";

/// A task handed to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub request_id: String,
    pub task: String,
    /// Shared context plus this agent's own instructions, already screened
    #[serde(default)]
    pub context: Payload,
}

/// An agent's answer to a [`TaskPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub content: String,
    pub confidence: f64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub latency_ms: u64,
    pub agent_type: String,
}

impl ReplyPayload {
    pub fn into_agent_response(self, agent_id: impl Into<String>) -> AgentResponse {
        AgentResponse {
            agent_id: agent_id.into(),
            agent_type: self.agent_type,
            response: self.content,
            confidence: concord_core::clamp_unit(self.confidence),
            tokens_used: self.tokens_used,
            latency_ms: self.latency_ms,
        }
    }
}

/// Serialize a payload struct into a message payload map.
pub fn to_payload<T: Serialize>(value: &T) -> ConcordResult<Payload> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(codec_error(format!("expected an object, got {other}"))),
        Err(e) => Err(codec_error(e.to_string())),
    }
}

/// Read a payload struct out of a message.
pub fn from_message<T: DeserializeOwned>(message: &AgentMessage) -> ConcordResult<T> {
    serde_json::from_value(serde_json::Value::Object(message.payload.clone()))
        .map_err(|e| codec_error(format!("message {}: {e}", message.id)))
}

fn codec_error(reason: String) -> concord_core::ConcordError {
    BusError::Codec { reason }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{ErrorKind, MessageType};

    #[test]
    fn test_task_payload_through_message() {
        let task = TaskPayload {
            request_id: "r1".to_string(),
            task: "summarize".to_string(),
            context: Payload::new(),
        };
        let message = AgentMessage::builder("o", "a", MessageType::Request, TOPIC_TASK)
            .with_payload(to_payload(&task).unwrap())
            .build();
        let back: TaskPayload = from_message(&message).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_reply_missing_content_is_codec_error() {
        let message = AgentMessage::builder("a", "o", MessageType::Response, TOPIC_TASK)
            .with_field("confidence", 0.5)
            .build();
        let err = from_message::<ReplyPayload>(&message).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_reply_confidence_is_clamped() {
        let reply = ReplyPayload {
            content: "x".to_string(),
            confidence: 1.7,
            tokens_used: 3,
            latency_ms: 1,
            agent_type: "writer".to_string(),
        };
        let response = reply.into_agent_response("w1");
        assert_eq!(response.confidence, 1.0);
        assert_eq!(response.agent_id, "w1");
    }
}
