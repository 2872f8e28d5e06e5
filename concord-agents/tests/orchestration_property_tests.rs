//! Property-Based Tests for Orchestration
//!
//! **Property 1: Partial Failure Is Not Total Failure**
//!
//! For any request dispatched to k succeeding and f failing agents with
//! k >= 1, the final response SHALL carry exactly k agent responses and f
//! recorded failures.
//!
//! **Property 2: Failures Discount Confidence**
//!
//! For any such request whose responses are equally clean, the confidence
//! score SHALL equal the mean agent confidence multiplied by 0.9 once per
//! failed agent.
//!
//! **Property 3: Abandoned Requests Leave Nothing Behind**
//!
//! For any orchestration whose caller stops waiting, every outstanding agent
//! request SHALL be cancelled and no waiter SHALL remain in the pending table.

use concord_agents::{ConcordRuntime, ModelAgent, Orchestrator};
use concord_bus::MessageBus;
use concord_core::{
    BusConfig, ComplexRequest, ConcordConfig, ErrorKind, OrchestratorConfig, QualityConfig,
};
use concord_llm::LanguageModel;
use concord_quality::QualityGate;
use concord_test_utils::{FailingModel, ScriptedModel, SlowModel};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// HELPERS
// ============================================================================

const ANSWERS: [(&str, f64); 4] = [
    ("The rollout starts with the staging cluster.", 0.8),
    ("Operators verify health checks before promotion.", 0.6),
    ("Database migrations run during the maintenance window.", 0.5),
    ("Release notes describe changed endpoints.", 0.9),
];

fn orchestrator(bus: &MessageBus) -> Orchestrator {
    let gate = Arc::new(QualityGate::new(QualityConfig::default()));
    let config = OrchestratorConfig {
        agent_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    Orchestrator::new(bus.clone(), gate, config).unwrap()
}

async fn attach(bus: &MessageBus, id: &str, model: Arc<dyn LanguageModel>) {
    let agent = Arc::new(ModelAgent::new(id, "planner", model));
    agent.attach(bus).await.unwrap();
}

fn answering(index: usize) -> Arc<dyn LanguageModel> {
    let (text, confidence) = ANSWERS[index];
    Arc::new(ScriptedModel::with_replies([format!(
        "{text}\nconfidence: {confidence}"
    )]))
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_agent_times_out_without_failing_request() {
    let bus = MessageBus::in_memory(BusConfig::default()).unwrap();
    let orchestrator = orchestrator(&bus);
    attach(&bus, "a1", answering(0)).await;
    attach(&bus, "a2", answering(1)).await;
    attach(
        &bus,
        "a3",
        Arc::new(SlowModel::new(Duration::from_secs(10), "Too late.")),
    )
    .await;

    let started = tokio::time::Instant::now();
    let request = ComplexRequest::new("req-d", "Plan the rollout").with_timeout_ms(200);
    let response = orchestrator.orchestrate(&request).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(response.request_id, "req-d");
    assert_eq!(response.agent_responses.len(), 2);
    assert!(response.agent_responses.contains_key("a1"));
    assert!(response.agent_responses.contains_key("a2"));
    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].agent_id, "a3");
    assert_eq!(response.failures[0].kind, ErrorKind::Timeout);
    assert!((response.confidence_score - 0.7 * 0.9).abs() < 1e-9);
    assert!(response
        .final_response
        .contains("The rollout starts with the staging cluster."));
    assert_eq!(bus.pending().waiting(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_orchestration_cancels_agent_requests() {
    let bus = MessageBus::in_memory(BusConfig::default()).unwrap();
    let orchestrator = orchestrator(&bus);
    for id in ["s1", "s2"] {
        attach(
            &bus,
            id,
            Arc::new(SlowModel::new(Duration::from_secs(60), "Eventually.")),
        )
        .await;
    }

    let request = ComplexRequest::new("req-cancel", "Plan the rollout");
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), orchestrator.orchestrate(&request)).await;
    assert!(abandoned.is_err());
    assert_eq!(bus.pending().waiting(), 0);
    assert_eq!(bus.stats().timeouts, 0);
}

#[tokio::test]
async fn test_runtime_serves_orchestration() {
    let runtime = ConcordRuntime::start(ConcordConfig::default(), None).unwrap();
    attach(runtime.bus(), "a1", answering(0)).await;
    attach(runtime.bus(), "a2", Arc::new(FailingModel::new("offline"))).await;

    let service = runtime.service().with_tenant("acme");
    let response = service
        .orchestrate(&ComplexRequest::new("req-rt", "Plan the rollout"))
        .await
        .unwrap();
    assert_eq!(response.agent_responses.len(), 1);
    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].kind, ErrorKind::Delivery);
    assert!((response.confidence_score - 0.8 * 0.9).abs() < 1e-9);

    runtime.shutdown().await;
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_failures_are_recorded_and_discounted(successes in 1usize..=4, failures in 0usize..=3) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let response = rt.block_on(async {
            let bus = MessageBus::in_memory(BusConfig::default()).unwrap();
            let orchestrator = orchestrator(&bus);
            for i in 0..successes {
                attach(&bus, &format!("ok-{i}"), answering(i)).await;
            }
            for j in 0..failures {
                attach(&bus, &format!("bad-{j}"), Arc::new(FailingModel::new("offline"))).await;
            }
            orchestrator
                .orchestrate(&ComplexRequest::new("req-p", "Plan the rollout"))
                .await
                .unwrap()
        });

        prop_assert_eq!(response.agent_responses.len(), successes);
        prop_assert_eq!(response.failures.len(), failures);

        let mean = ANSWERS[..successes].iter().map(|(_, c)| c).sum::<f64>() / successes as f64;
        let expected = mean * 0.9f64.powi(failures as i32);
        prop_assert!((response.confidence_score - expected).abs() < 1e-9);
        prop_assert!((0.0..=1.0).contains(&response.quality_score));
    }
}
