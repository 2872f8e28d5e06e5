//! Call shapes exposed to an HTTP layer.
//!
//! The REST surface itself lives outside this workspace; these types are the
//! request and response bodies it serializes.

use crate::{AnalysisReport, ComplexRequest, FailureDetection, FinalResponse, MitigationReport};
use serde::{Deserialize, Serialize};

/// `POST context/validate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ValidateRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ValidateResponse {
    pub issues: Vec<FailureDetection>,
    pub overall_quality_score: f64,
    pub recommendations: Vec<String>,
}

impl From<AnalysisReport> for ValidateResponse {
    fn from(report: AnalysisReport) -> Self {
        Self {
            issues: report.detections,
            overall_quality_score: report.overall_score,
            recommendations: report.recommendations,
        }
    }
}

/// `POST context/mitigate`
///
/// Takes the original content together with the issues to address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct MitigateRequest {
    pub content: String,
    #[serde(default)]
    pub issues: Vec<FailureDetection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct MitigateResponse {
    pub mitigated_content: String,
    pub changes: Vec<String>,
    pub improvement: f64,
}

impl From<MitigationReport> for MitigateResponse {
    fn from(report: MitigationReport) -> Self {
        Self {
            mitigated_content: report.mitigated_content,
            changes: report.change_log,
            improvement: report.improvement_score,
        }
    }
}

/// `POST agents/orchestrate`
pub type OrchestrateRequest = ComplexRequest;

/// Response body of `POST agents/orchestrate`.
pub type OrchestrateResponse = FinalResponse;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContextMetrics, FailureMode};

    #[test]
    fn test_validate_response_from_report() {
        let report = AnalysisReport {
            metrics: ContextMetrics::default(),
            detections: vec![FailureDetection::new(
                FailureMode::Poisoning,
                0.5,
                "phrases",
                vec![],
            )],
            overall_score: 0.6,
            recommendations: vec!["check".into()],
        };
        let resp = ValidateResponse::from(report);
        assert_eq!(resp.issues.len(), 1);
        assert_eq!(resp.overall_quality_score, 0.6);
        assert_eq!(resp.recommendations, vec!["check".to_string()]);
    }

    #[test]
    fn test_mitigate_request_issues_default_empty() {
        let req: MitigateRequest = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert!(req.issues.is_empty());
    }
}
