//! Fan a task out to several agents and combine their answers.

use crate::aggregate::{
    aggregate_confidence, join_responses, quality_weight, ranked, synthesize, Contribution,
};
use crate::protocol::{from_message, to_payload, ReplyPayload, TaskPayload, TOPIC_TASK};
use crate::selection::select_agents;
use concord_bus::{EndpointInfo, MessageBus};
use concord_core::{
    clamp_unit, AgentFailure, ComplexRequest, ConcordError, ConcordResult, FinalResponse,
    OrchestrationError, OrchestratorConfig, Payload,
};
use concord_quality::QualityGate;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Context key under which an agent receives its own instructions.
pub const CONTEXT_INSTRUCTIONS: &str = "instructions";

/// Dispatches [`ComplexRequest`]s over the bus and aggregates the answers.
///
/// Content is screened by the quality gate on the way in (description and
/// context), on the way back (each response) and once more on the
/// synthesized result. Only the first two can reject a request.
#[derive(Clone)]
pub struct Orchestrator {
    bus: MessageBus,
    gate: Arc<QualityGate>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// # Errors
    /// Returns a configuration error if `config` is invalid.
    pub fn new(bus: MessageBus, gate: Arc<QualityGate>, config: OrchestratorConfig) -> ConcordResult<Self> {
        config.validate()?;
        Ok(Self { bus, gate, config })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one request across the selected agents.
    ///
    /// Agents that time out, fail, answer malformed payloads or answer with
    /// rejected content are recorded in `failures` and lower the confidence;
    /// the call itself fails only when no agent produced a usable response.
    /// Dropping the returned future cancels every outstanding agent request.
    ///
    /// # Errors
    /// - `QualityRejected` if the description or shared context exceeds the
    ///   gate's hard ceiling
    /// - `NoAgentsAvailable` if no live agent matches
    /// - `AllAgentsFailed` if every selected agent failed
    pub async fn orchestrate(&self, request: &ComplexRequest) -> ConcordResult<FinalResponse> {
        let started = Instant::now();

        let task = self.gate.screen(&request.description).await?;
        let shared = self.screen_context(request.shared_context()).await?;

        let (agents, source) =
            select_agents(request, &self.bus.live_endpoints(), &self.config.default_agents);
        if agents.is_empty() {
            tracing::warn!(request_id = %request.request_id, "No live agents for request");
            return Err(OrchestrationError::NoAgentsAvailable {
                request_id: request.request_id.clone(),
            }
            .into());
        }
        tracing::info!(
            request_id = %request.request_id,
            agents = agents.len(),
            selection = source.as_str(),
            description_mitigated = task.was_mitigated(),
            "Orchestrating request"
        );

        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.agent_timeout);
        let calls = agents
            .iter()
            .map(|agent| self.consult(request, agent, &task.content, &shared, timeout));
        let outcomes = join_all(calls).await;

        let mut contributions = Vec::new();
        let mut failures = Vec::new();
        for (agent, outcome) in agents.iter().zip(outcomes) {
            match outcome {
                Ok(contribution) => contributions.push(contribution),
                Err(e) => {
                    tracing::warn!(
                        request_id = %request.request_id,
                        agent_id = %agent.agent_id,
                        kind = %e.kind(),
                        error = %e,
                        "Agent failed"
                    );
                    failures.push(AgentFailure {
                        agent_id: agent.agent_id.clone(),
                        agent_type: agent.agent_type.clone(),
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if contributions.is_empty() {
            tracing::error!(
                request_id = %request.request_id,
                failures = failures.len(),
                "All agents failed"
            );
            return Err(OrchestrationError::AllAgentsFailed {
                request_id: request.request_id.clone(),
                failures: failures
                    .iter()
                    .map(|f| format!("{}: {}", f.agent_id, f.reason))
                    .collect(),
            }
            .into());
        }

        let confidence_score =
            aggregate_confidence(&contributions, failures.len(), self.config.failure_discount);
        let (final_response, quality_score) =
            self.finalize(&request.request_id, &contributions).await;

        let agent_responses: BTreeMap<_, _> = contributions
            .into_iter()
            .map(|c| (c.response.agent_id.clone(), c.response))
            .collect();

        tracing::info!(
            request_id = %request.request_id,
            responses = agent_responses.len(),
            failures = failures.len(),
            confidence = confidence_score,
            quality = quality_score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Orchestration completed"
        );

        Ok(FinalResponse {
            request_id: request.request_id.clone(),
            final_response,
            confidence_score,
            agent_responses,
            failures,
            quality_score,
        })
    }

    /// Synthesize the final answer and its quality score.
    ///
    /// Every response already passed the gate, but their combination can
    /// still exceed the hard ceiling. The combined text is then mitigated;
    /// if it still exceeds the ceiling, the answer is rebuilt from the
    /// highest-ranked responses that fit and the score is scaled by the
    /// share of responses kept.
    async fn finalize(&self, request_id: &str, contributions: &[Contribution]) -> (String, f64) {
        let combined = synthesize(contributions);
        let err = match self.gate.screen(&combined).await {
            Ok(outcome) => return (outcome.content, clamp_unit(outcome.final_score)),
            Err(e) => e,
        };
        tracing::warn!(
            request_id = %request_id,
            error = %err,
            "Synthesized answer rejected, mitigating"
        );

        let analysis = self.gate.analyze(&combined);
        let mitigation = self.gate.mitigate(&combined, &analysis.detections).await;
        let after = self.gate.analyze(&mitigation.mitigated_content);
        if self.gate.check_ceiling(&after).is_ok() {
            return (mitigation.mitigated_content, clamp_unit(after.overall_score));
        }

        let kept = within_ceiling(&self.gate, contributions);
        tracing::warn!(
            request_id = %request_id,
            kept = kept.len(),
            total = contributions.len(),
            "Synthesized answer rebuilt from responses under the ceiling"
        );
        let share = kept.len() as f64 / contributions.len() as f64;
        let text = join_responses(kept);
        let score = self.gate.analyze(&text).overall_score * share;
        (text, clamp_unit(score))
    }

    /// Ask one agent and screen its answer.
    async fn consult(
        &self,
        request: &ComplexRequest,
        agent: &EndpointInfo,
        task: &str,
        shared: &Payload,
        timeout: Duration,
    ) -> ConcordResult<Contribution> {
        let mut context = shared.clone();
        if let Some(own) = request.agent_context(&agent.agent_id, &agent.agent_type) {
            context.insert(CONTEXT_INSTRUCTIONS.to_string(), self.screen_value(own.clone()).await?);
        }
        let payload = to_payload(&TaskPayload {
            request_id: request.request_id.clone(),
            task: task.to_string(),
            context,
        })?;

        let reply = self
            .bus
            .request(&self.config.orchestrator_id, &agent.agent_id, TOPIC_TASK, payload, timeout)
            .await?
            .await?;
        let reply: ReplyPayload = from_message(&reply)?;

        let screened = self.gate.screen(&reply.content).await?;
        let weight = quality_weight(&screened.analysis, self.config.min_quality_weight);
        let mut response = reply.into_agent_response(agent.agent_id.clone());
        response.response = screened.content;

        tracing::debug!(
            request_id = %request.request_id,
            agent_id = %agent.agent_id,
            confidence = response.confidence,
            quality_weight = weight,
            mitigated = screened.mitigation.is_some(),
            "Agent response screened"
        );
        Ok(Contribution {
            response,
            quality_weight: weight,
        })
    }

    async fn screen_context(&self, context: Payload) -> ConcordResult<Payload> {
        let mut screened = Payload::new();
        for (key, value) in context {
            screened.insert(key, self.screen_value(value).await?);
        }
        Ok(screened)
    }

    /// Screen string values; other JSON values pass through untouched.
    async fn screen_value(&self, value: Value) -> ConcordResult<Value> {
        match value {
            Value::String(text) => Ok(Value::String(self.gate.screen(&text).await?.content)),
            other => Ok(other),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("orchestrator_id", &self.config.orchestrator_id)
            .field("bus", &self.bus.instance_id())
            .finish()
    }
}

/// The highest-ranked contributions whose joined text stays within the
/// gate's hard ceiling, in rank order.
fn within_ceiling<'a>(
    gate: &QualityGate,
    contributions: &'a [Contribution],
) -> Vec<&'a Contribution> {
    let mut kept: Vec<&Contribution> = Vec::new();
    for candidate in ranked(contributions) {
        kept.push(candidate);
        let text = join_responses(kept.iter().copied());
        if gate.check_ceiling(&gate.analyze(&text)).is_err() {
            kept.pop();
        }
    }
    kept
}

/// Whether an error means the content itself was refused.
pub fn is_quality_rejection(err: &ConcordError) -> bool {
    matches!(err, ConcordError::Quality(_))
}

// ============================================================================
// TESTS
// ============================================================================
