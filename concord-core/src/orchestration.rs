//! Orchestration request/response types.

use crate::{AgentId, ErrorKind, Payload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Context key prefix for entries meant for one agent only.
///
/// `"agent:researcher"` is delivered to agents of type (or id) `researcher`
/// and to no one else. Entries without the prefix are shared with every
/// selected agent.
pub const AGENT_CONTEXT_PREFIX: &str = "agent:";

/// A task to fan out across several agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ComplexRequest {
    pub request_id: String,
    pub description: String,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub context: Payload,
    /// Agent types or ids to use; empty lets the orchestrator choose
    #[serde(default)]
    pub preferred_agents: Vec<String>,
    /// Per-agent deadline override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ComplexRequest {
    pub fn new(request_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            description: description.into(),
            context: Payload::new(),
            preferred_agents: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_preferred_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Context entries shared with every agent.
    pub fn shared_context(&self) -> Payload {
        self.context
            .iter()
            .filter(|(k, _)| !k.starts_with(AGENT_CONTEXT_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Context entry reserved for one agent, matched by id first, then type.
    pub fn agent_context(&self, agent_id: &str, agent_type: &str) -> Option<&serde_json::Value> {
        self.context
            .get(&format!("{AGENT_CONTEXT_PREFIX}{agent_id}"))
            .or_else(|| self.context.get(&format!("{AGENT_CONTEXT_PREFIX}{agent_type}")))
    }
}

/// One agent's contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentResponse {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub response: String,
    pub confidence: f64,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

/// An agent that produced no usable response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentFailure {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Aggregated orchestration result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FinalResponse {
    pub request_id: String,
    pub final_response: String,
    pub confidence_score: f64,
    pub agent_responses: BTreeMap<AgentId, AgentResponse>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<AgentFailure>,
    /// Overall quality score of `final_response`
    pub quality_score: f64,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shared_and_agent_context_split() {
        let req = ComplexRequest::new("r1", "summarize")
            .with_context("audience", "engineers")
            .with_context("agent:critic", "be harsh")
            .with_context("agent:writer-1", "use bullet points");

        let shared = req.shared_context();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared.get("audience"), Some(&json!("engineers")));

        assert_eq!(req.agent_context("critic-7", "critic"), Some(&json!("be harsh")));
        assert_eq!(
            req.agent_context("writer-1", "writer"),
            Some(&json!("use bullet points"))
        );
        assert!(req.agent_context("analyst-1", "analyst").is_none());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: ComplexRequest =
            serde_json::from_str(r#"{"request_id":"r","description":"d"}"#).unwrap();
        assert!(req.context.is_empty());
        assert!(req.preferred_agents.is_empty());
        assert!(req.timeout_ms.is_none());
    }

    #[test]
    fn test_final_response_omits_empty_failures() {
        let resp = FinalResponse {
            request_id: "r".into(),
            final_response: "done".into(),
            confidence_score: 0.8,
            agent_responses: BTreeMap::new(),
            failures: vec![],
            quality_score: 1.0,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("failures").is_none());
    }
}
