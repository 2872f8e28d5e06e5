//! Combining per-agent responses into one result.

use concord_core::{clamp_unit, AgentResponse, AnalysisReport};

/// A successful agent response with its quality weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub response: AgentResponse,
    /// `1 - worst detected severity` of the response, floored
    pub quality_weight: f64,
}

impl Contribution {
    /// Weight of this contribution in the synthesized content.
    pub fn rank(&self) -> f64 {
        self.response.confidence * self.quality_weight
    }
}

/// Quality weight of a screened response: one minus its worst detected
/// severity, never below `floor`.
pub fn quality_weight(analysis: &AnalysisReport, floor: f64) -> f64 {
    clamp_unit((1.0 - analysis.max_detected_severity()).max(floor))
}

/// Quality-weighted mean confidence, multiplied by `(1 - discount)` once per
/// failed agent. Zero when there are no contributions.
pub fn aggregate_confidence(contributions: &[Contribution], failures: usize, discount: f64) -> f64 {
    let (weighted, total) = contributions.iter().fold((0.0, 0.0), |(w, t), c| {
        (w + c.response.confidence * c.quality_weight, t + c.quality_weight)
    });
    if total <= 0.0 {
        return 0.0;
    }
    let penalty = (1.0 - discount).powi(failures.min(i32::MAX as usize) as i32);
    clamp_unit(weighted / total * penalty)
}

/// Join the responses, highest ranked first. Ties keep agent id order.
pub fn synthesize(contributions: &[Contribution]) -> String {
    join_responses(ranked(contributions))
}

/// Contributions ordered by rank, highest first, ties by agent id.
pub fn ranked(contributions: &[Contribution]) -> Vec<&Contribution> {
    let mut ordered: Vec<&Contribution> = contributions.iter().collect();
    ordered.sort_by(|a, b| {
        b.rank()
            .total_cmp(&a.rank())
            .then_with(|| a.response.agent_id.cmp(&b.response.agent_id))
    });
    ordered
}

/// Join non-empty responses in the given order, one paragraph each.
pub fn join_responses<'a>(ordered: impl IntoIterator<Item = &'a Contribution>) -> String {
    ordered
        .into_iter()
        .map(|c| c.response.response.trim())
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(id: &str, text: &str, confidence: f64, quality_weight: f64) -> Contribution {
        Contribution {
            response: AgentResponse {
                agent_id: id.to_string(),
                agent_type: "t".to_string(),
                response: text.to_string(),
                confidence,
                tokens_used: 0,
                latency_ms: 0,
            },
            quality_weight,
        }
    }

    #[test]
    fn test_confidence_weighted_by_quality() {
        let contributions = vec![
            contribution("a", "x", 0.9, 1.0),
            contribution("b", "y", 0.3, 0.5),
        ];
        let expected = (0.9 + 0.15) / 1.5;
        assert!((aggregate_confidence(&contributions, 0, 0.1) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_failures_discount_confidence() {
        let contributions = vec![contribution("a", "x", 0.8, 1.0)];
        let c = aggregate_confidence(&contributions, 2, 0.1);
        assert!((c - 0.8 * 0.81).abs() < 1e-12);
    }

    #[test]
    fn test_no_contributions_is_zero() {
        assert_eq!(aggregate_confidence(&[], 3, 0.1), 0.0);
    }

    #[test]
    fn test_synthesize_orders_by_rank() {
        let contributions = vec![
            contribution("a", "low", 0.4, 1.0),
            contribution("b", "high", 0.9, 1.0),
            contribution("c", "flagged", 0.95, 0.1),
            contribution("d", "  ", 1.0, 1.0),
        ];
        assert_eq!(synthesize(&contributions), "high\n\nlow\n\nflagged");
    }

    #[test]
    fn test_quality_weight_floor() {
        use concord_core::{ContextMetrics, FailureDetection, FailureMode};
        let analysis = AnalysisReport {
            metrics: ContextMetrics::default(),
            detections: vec![FailureDetection::new(FailureMode::Manipulation, 1.0, "", vec![])],
            overall_score: 0.0,
            recommendations: vec![],
        };
        assert_eq!(quality_weight(&analysis, 0.05), 0.05);
    }
}
