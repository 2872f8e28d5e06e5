//! Concord Agents - Multi-Agent Orchestration
//!
//! Coordinates model-backed agents over the message bus:
//! - Model-backed agent workers with conversation memory and shared notes
//! - Agent selection by preference, defaults or capability keywords
//! - Parallel dispatch with per-request timeouts and cancellation
//! - Quality screening of every input and output through the gate
//! - Confidence aggregation discounted per failed agent
//!
//! ```no_run
//! use concord_agents::{ConcordRuntime, ModelAgent};
//! use concord_core::{ComplexRequest, ConcordConfig};
//! use concord_llm::MockLanguageModel;
//! use std::sync::Arc;
//!
//! # async fn demo() -> concord_core::ConcordResult<()> {
//! let runtime = ConcordRuntime::start(ConcordConfig::default(), None)?;
//!
//! let writer = Arc::new(ModelAgent::new("writer-1", "writer", Arc::new(MockLanguageModel::new())));
//! writer.attach(runtime.bus()).await?;
//!
//! let response = runtime
//!     .orchestrator()
//!     .orchestrate(&ComplexRequest::new("req-1", "Draft the release notes"))
//!     .await?;
//! println!("{} ({:.2})", response.final_response, response.confidence_score);
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod orchestrator;
pub mod protocol;
pub mod runtime;
pub mod selection;
pub mod service;
pub mod telemetry;
pub mod worker;

pub use aggregate::{
    aggregate_confidence, join_responses, quality_weight, ranked, synthesize, Contribution,
};
pub use orchestrator::{is_quality_rejection, Orchestrator, CONTEXT_INSTRUCTIONS};
pub use protocol::{ReplyPayload, TaskPayload, FIELD_NOTE, TOPIC_TASK};
pub use runtime::ConcordRuntime;
pub use selection::{select_agents, SelectionSource};
pub use service::ConcordService;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use worker::{heartbeat_task, spawn_heartbeat, split_confidence, ModelAgent};
