//! Explicit startup wiring: bus, quality gate and orchestrator.

use crate::orchestrator::Orchestrator;
use crate::service::ConcordService;
use concord_bus::{BusTaskSummary, BusTasks, DistributedChannel, InMemoryChannel, MessageBus};
use concord_core::{ConcordConfig, ConcordResult};
use concord_llm::LanguageModel;
use concord_quality::QualityGate;
use std::sync::Arc;

/// A running Concord instance.
///
/// Construction order is bus, then gate, then orchestrator. The bus's
/// sweeper and distributed listener run until [`ConcordRuntime::shutdown`].
#[derive(Debug)]
pub struct ConcordRuntime {
    bus: MessageBus,
    gate: Arc<QualityGate>,
    orchestrator: Orchestrator,
    tasks: BusTasks,
}

impl ConcordRuntime {
    /// Start a single-process runtime backed by an in-memory channel.
    ///
    /// # Arguments
    /// * `config` - Complete configuration, validated before anything starts
    /// * `model` - Model used by the gate for rewrite mitigation; `None`
    ///   limits mitigation to the local strategies
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid.
    pub fn start(
        config: ConcordConfig,
        model: Option<Arc<dyn LanguageModel>>,
    ) -> ConcordResult<Self> {
        Self::start_with_channel(config, model, Arc::new(InMemoryChannel::new()))
    }

    /// Start a runtime that shares `channel` with other bus instances.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_with_channel(
        config: ConcordConfig,
        model: Option<Arc<dyn LanguageModel>>,
        channel: Arc<dyn DistributedChannel>,
    ) -> ConcordResult<Self> {
        config.validate()?;

        let bus = MessageBus::new(config.bus, channel)?;
        let gate = QualityGate::new(config.quality);
        let gate = Arc::new(match model {
            Some(model) => gate.with_model(model),
            None => gate,
        });
        let orchestrator = Orchestrator::new(bus.clone(), gate.clone(), config.orchestrator)?;
        let tasks = bus.start()?;

        tracing::info!(
            instance_id = %bus.instance_id(),
            topic = %bus.channel_topic(),
            "Concord runtime started"
        );
        Ok(Self {
            bus,
            gate,
            orchestrator,
            tasks,
        })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn gate(&self) -> &Arc<QualityGate> {
        &self.gate
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// A service facade over this runtime's gate and orchestrator.
    pub fn service(&self) -> ConcordService {
        ConcordService::new(self.gate.clone(), self.orchestrator.clone())
    }

    /// Stop the background tasks and report their totals.
    pub async fn shutdown(self) -> BusTaskSummary {
        tracing::info!(instance_id = %self.bus.instance_id(), "Concord runtime shutting down");
        let summary = self.tasks.shutdown().await;
        tracing::info!(
            sweeps = summary.sweeps,
            envelopes_received = summary.envelopes_received,
            "Concord runtime stopped"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{BusConfig, ErrorKind};
    use std::time::Duration;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ConcordConfig {
            bus: BusConfig {
                max_message_size: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = ConcordRuntime::start(config, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let config = ConcordConfig {
            bus: BusConfig {
                sweep_interval: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let runtime = ConcordRuntime::start(config, None).unwrap();
        assert!(runtime.bus().endpoints().is_empty());
        assert!(runtime.service().tenant_id().is_none());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let summary = runtime.shutdown().await;
        assert_eq!(summary.sweeps, 3);
    }
}
