//! Failure-mode model for the quality gate.
//!
//! These are the transient records the detector and mitigator produce per
//! call. Nothing here is persisted.

use crate::clamp_unit;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// FAILURE MODE
// ============================================================================

/// The eight ways agent-facing text can go wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum FailureMode {
    /// Hallucinated or overconfident factual claims
    Poisoning,
    /// Content spread across too many topics
    Distraction,
    /// Self-contradicting statements
    Confusion,
    /// Conflicting instructions
    Clash,
    /// Repeated words and phrases
    Repetition,
    /// High-entropy or malformed text
    Incoherence,
    /// Toxic or slanted language
    Bias,
    /// Jailbreaks, encoded payloads, prompt injection
    Manipulation,
}

impl FailureMode {
    /// Every mode, in canonical order.
    pub const ALL: [FailureMode; 8] = [
        FailureMode::Poisoning,
        FailureMode::Distraction,
        FailureMode::Confusion,
        FailureMode::Clash,
        FailureMode::Repetition,
        FailureMode::Incoherence,
        FailureMode::Bias,
        FailureMode::Manipulation,
    ];

    /// Severity above which the mode counts as detected.
    ///
    /// Distraction scores `1 - dominant_share` only when more than five topics
    /// are present, so its 0.7 threshold is the "dominant share below 30%" rule.
    pub fn threshold(&self) -> f64 {
        match self {
            FailureMode::Poisoning => 0.3,
            FailureMode::Distraction => 0.7,
            FailureMode::Confusion => 0.3,
            FailureMode::Clash => 0.3,
            FailureMode::Repetition => 0.3,
            FailureMode::Incoherence => 0.4,
            FailureMode::Bias => 0.5,
            FailureMode::Manipulation => 0.4,
        }
    }

    /// Weight of this mode in the overall quality score.
    pub fn weight(&self) -> f64 {
        match self {
            FailureMode::Poisoning | FailureMode::Manipulation => 2.0,
            FailureMode::Bias => 1.5,
            FailureMode::Confusion | FailureMode::Clash | FailureMode::Incoherence => 1.0,
            FailureMode::Distraction | FailureMode::Repetition => 0.5,
        }
    }

    /// Whether a hard severity ceiling applies to this mode.
    pub fn is_blocking(&self) -> bool {
        matches!(self, FailureMode::Poisoning | FailureMode::Manipulation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureMode::Poisoning => "poisoning",
            FailureMode::Distraction => "distraction",
            FailureMode::Confusion => "confusion",
            FailureMode::Clash => "clash",
            FailureMode::Repetition => "repetition",
            FailureMode::Incoherence => "incoherence",
            FailureMode::Bias => "bias",
            FailureMode::Manipulation => "manipulation",
        }
    }

    pub fn from_str_name(s: &str) -> Result<Self, FailureModeParseError> {
        let lower = s.to_ascii_lowercase();
        FailureMode::ALL
            .into_iter()
            .find(|m| m.as_str() == lower)
            .ok_or_else(|| FailureModeParseError(s.to_string()))
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FailureMode {
    type Err = FailureModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_name(s)
    }
}

/// Error when parsing an invalid failure mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureModeParseError(pub String);

impl fmt::Display for FailureModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid failure mode: {}", self.0)
    }
}

impl std::error::Error for FailureModeParseError {}

// ============================================================================
// DETECTION
// ============================================================================

/// One detector verdict.
///
/// `detected` always agrees with `severity > mode.threshold()`; construct
/// through [`FailureDetection::new`] to keep it that way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FailureDetection {
    pub mode: FailureMode,
    pub detected: bool,
    pub severity: f64,
    pub evidence: String,
    #[serde(default)]
    pub locations: Vec<String>,
}

impl FailureDetection {
    /// Create a detection, clamping severity into `[0, 1]`.
    pub fn new(
        mode: FailureMode,
        severity: f64,
        evidence: impl Into<String>,
        locations: Vec<String>,
    ) -> Self {
        let severity = clamp_unit(severity);
        Self {
            mode,
            detected: severity > mode.threshold(),
            severity,
            evidence: evidence.into(),
            locations,
        }
    }

    /// A zero-severity verdict.
    pub fn clear(mode: FailureMode) -> Self {
        Self::new(mode, 0.0, "", Vec::new())
    }
}

/// Statistics computed once per analyzed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ContextMetrics {
    pub total_tokens: usize,
    pub unique_tokens: usize,
    /// Shannon entropy normalized to `[0, 1]`
    pub entropy: f64,
    pub perplexity: f64,
    /// Content word -> occurrences, for words seen at least twice
    pub topic_distribution: BTreeMap<String, usize>,
    /// `[-1, 1]`
    pub sentiment: f64,
    /// `[0, 1]`
    pub toxicity: f64,
}

impl ContextMetrics {
    pub fn topic_count(&self) -> usize {
        self.topic_distribution.len()
    }

    /// Most frequent topic and its share of all topic occurrences.
    /// Ties resolve to the alphabetically first topic.
    pub fn dominant_topic(&self) -> Option<(&str, f64)> {
        let total: usize = self.topic_distribution.values().sum();
        if total == 0 {
            return None;
        }
        let mut best: Option<(&str, usize)> = None;
        for (topic, count) in &self.topic_distribution {
            match best {
                Some((_, c)) if c >= *count => {}
                _ => best = Some((topic.as_str(), *count)),
            }
        }
        best.map(|(topic, count)| (topic, count as f64 / total as f64))
    }
}

/// Full detector output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AnalysisReport {
    pub metrics: ContextMetrics,
    /// One entry per mode, in [`FailureMode::ALL`] order
    pub detections: Vec<FailureDetection>,
    pub overall_score: f64,
    pub recommendations: Vec<String>,
}

impl AnalysisReport {
    /// Detections whose severity crossed their threshold.
    pub fn detected(&self) -> impl Iterator<Item = &FailureDetection> {
        self.detections.iter().filter(|d| d.detected)
    }

    pub fn has_detections(&self) -> bool {
        self.detections.iter().any(|d| d.detected)
    }

    pub fn detection(&self, mode: FailureMode) -> Option<&FailureDetection> {
        self.detections.iter().find(|d| d.mode == mode)
    }

    /// Highest severity across all modes, detected or not.
    pub fn max_severity(&self) -> f64 {
        self.detections
            .iter()
            .map(|d| d.severity)
            .fold(0.0, f64::max)
    }

    /// Highest severity among detected modes; 0 when nothing was detected.
    pub fn max_detected_severity(&self) -> f64 {
        self.detected().map(|d| d.severity).fold(0.0, f64::max)
    }
}

// ============================================================================
// MITIGATION
// ============================================================================

/// What one mitigation strategy did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct MitigationAction {
    pub mode: FailureMode,
    pub description: String,
    pub changes_applied: usize,
    /// Estimated severity reduction, capped at [`MitigationAction::MAX_REDUCTION`]
    pub severity_reduction: f64,
}

impl MitigationAction {
    pub const MAX_REDUCTION: f64 = 0.5;

    pub fn new(mode: FailureMode, description: impl Into<String>, changes_applied: usize) -> Self {
        Self {
            mode,
            description: description.into(),
            changes_applied,
            severity_reduction: 0.0,
        }
    }

    pub fn with_reduction(mut self, reduction: f64) -> Self {
        self.severity_reduction = clamp_unit(reduction).min(Self::MAX_REDUCTION);
        self
    }

    pub fn changed(&self) -> bool {
        self.changes_applied > 0
    }
}

/// Mitigator output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct MitigationReport {
    pub mitigated_content: String,
    pub actions: Vec<MitigationAction>,
    pub change_log: Vec<String>,
    /// Overall score after minus overall score before
    pub improvement_score: f64,
}

impl MitigationReport {
    /// A report for content that needed no changes.
    pub fn unchanged(content: impl Into<String>) -> Self {
        Self {
            mitigated_content: content.into(),
            actions: Vec::new(),
            change_log: Vec::new(),
            improvement_score: 0.0,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.change_log.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names_roundtrip() {
        for mode in FailureMode::ALL {
            assert_eq!(mode.as_str().parse::<FailureMode>(), Ok(mode));
        }
        assert!("gossip".parse::<FailureMode>().is_err());
    }

    #[test]
    fn test_weights_sum() {
        let total: f64 = FailureMode::ALL.iter().map(|m| m.weight()).sum();
        assert!((total - 9.5).abs() < 1e-9);
    }

    #[test]
    fn test_detection_respects_threshold() {
        let below = FailureDetection::new(FailureMode::Incoherence, 0.4, "", vec![]);
        assert!(!below.detected);
        let above = FailureDetection::new(FailureMode::Incoherence, 0.41, "", vec![]);
        assert!(above.detected);
    }

    #[test]
    fn test_detection_clamps_severity() {
        let d = FailureDetection::new(FailureMode::Poisoning, 3.0, "x", vec![]);
        assert_eq!(d.severity, 1.0);
        let d = FailureDetection::new(FailureMode::Poisoning, -1.0, "x", vec![]);
        assert_eq!(d.severity, 0.0);
        assert!(!d.detected);
    }

    #[test]
    fn test_dominant_topic() {
        let mut metrics = ContextMetrics::default();
        assert!(metrics.dominant_topic().is_none());
        metrics.topic_distribution.insert("rust".into(), 6);
        metrics.topic_distribution.insert("async".into(), 2);
        metrics.topic_distribution.insert("bus".into(), 2);
        let (topic, share) = metrics.dominant_topic().unwrap();
        assert_eq!(topic, "rust");
        assert!((share - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_mitigation_reduction_cap() {
        let a = MitigationAction::new(FailureMode::Repetition, "dedup", 3).with_reduction(0.9);
        assert_eq!(a.severity_reduction, MitigationAction::MAX_REDUCTION);
        assert!(a.changed());
    }

    #[test]
    fn test_mode_serializes_snake_case() {
        let json = serde_json::to_string(&FailureMode::Manipulation).unwrap();
        assert_eq!(json, "\"manipulation\"");
    }
}
