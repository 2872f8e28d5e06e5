//! Library-level facade behind the `context/validate`, `context/mitigate`
//! and `agents/orchestrate` endpoints.

use crate::orchestrator::Orchestrator;
use concord_core::{
    ErrorReport, MitigateRequest, MitigateResponse, OrchestrateRequest, OrchestrateResponse,
    ValidateRequest, ValidateResponse,
};
use concord_quality::QualityGate;
use std::sync::Arc;

/// Serves the external call shapes and never leaks raw internal errors.
#[derive(Debug, Clone)]
pub struct ConcordService {
    gate: Arc<QualityGate>,
    orchestrator: Orchestrator,
    tenant_id: Option<String>,
}

impl ConcordService {
    pub fn new(gate: Arc<QualityGate>, orchestrator: Orchestrator) -> Self {
        Self {
            gate,
            orchestrator,
            tenant_id: None,
        }
    }

    /// Scope error reports to a tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Score content for all eight failure modes.
    pub fn validate(&self, request: &ValidateRequest) -> ValidateResponse {
        self.gate.analyze(&request.content).into()
    }

    /// Repair content. When the request carries no issues the content is
    /// analyzed first and every detected issue is addressed.
    pub async fn mitigate(&self, request: &MitigateRequest) -> MitigateResponse {
        let report = if request.issues.is_empty() {
            let analysis = self.gate.analyze(&request.content);
            self.gate.mitigate(&request.content, &analysis.detections).await
        } else {
            self.gate.mitigate(&request.content, &request.issues).await
        };
        report.into()
    }

    /// Orchestrate a request, reporting failures as [`ErrorReport`]s carrying
    /// the request id and tenant.
    pub async fn orchestrate(
        &self,
        request: &OrchestrateRequest,
    ) -> Result<OrchestrateResponse, ErrorReport> {
        self.orchestrator.orchestrate(request).await.map_err(|e| {
            let report = ErrorReport::from(&e)
                .with_request_id(request.request_id.clone())
                .with_tenant_id(self.tenant_id.clone());
            tracing::warn!(
                request_id = %request.request_id,
                tenant_id = ?self.tenant_id,
                kind = %report.kind,
                "Orchestrate request failed"
            );
            report
        })
    }
}
