//! Failure-mode mitigator.
//!
//! One fixed strategy per mode. Local strategies rewrite text with pattern
//! tables; rewrite strategies delegate a targeted prompt to a language model.
//! Detected modes are processed most severe first.

use crate::detector::{
    contradictory_pairs, repeated_trigrams, ContextDetector, MAX_TRIGRAM_REPEATS,
};
use crate::metrics::{compute_metrics, split_sentences, tokenize};
use crate::patterns::{
    tidy, ABSOLUTE_DOWNGRADES, ABSOLUTE_WORDS, ENCODED_BLOBS, HALLUCINATION_PHRASES,
    INJECTION_DELIMITERS, JAILBREAK_PATTERNS, PERCENTAGE, ROLE_HEADER_LINE,
};
use concord_core::{
    ContextMetrics, FailureDetection, FailureMode, MitigationAction, MitigationReport,
    QualityConfig,
};
use concord_llm::{GenerateOptions, LanguageModel};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Statistical claims above this percentage are clamped down to it.
const MAX_PLAUSIBLE_PERCENT: f64 = 95.0;

/// Word-set similarity above which two sentences count as duplicates.
const DUPLICATE_SIMILARITY: f64 = 0.8;

type LocalFn = fn(&str) -> (String, usize);
type PromptFn = fn(&str, &ContextMetrics) -> String;

#[derive(Clone, Copy)]
enum Strategy {
    Local(LocalFn, &'static str),
    Rewrite(PromptFn, &'static str),
}

/// Mode -> strategy, in canonical mode order.
const STRATEGIES: [(FailureMode, Strategy); 8] = [
    (
        FailureMode::Poisoning,
        Strategy::Local(
            mitigate_poisoning,
            "Removed unsupported claims and hedged absolute language",
        ),
    ),
    (
        FailureMode::Distraction,
        Strategy::Rewrite(distraction_prompt, "Refocused content on its dominant topic"),
    ),
    (
        FailureMode::Confusion,
        Strategy::Local(mitigate_confusion, "Dropped contradicting sentences"),
    ),
    (
        FailureMode::Clash,
        Strategy::Rewrite(clash_prompt, "Reconciled conflicting instructions"),
    ),
    (
        FailureMode::Repetition,
        Strategy::Local(mitigate_repetition, "Removed duplicate sentences and phrases"),
    ),
    (
        FailureMode::Incoherence,
        Strategy::Rewrite(incoherence_prompt, "Rewrote content for coherence"),
    ),
    (
        FailureMode::Bias,
        Strategy::Rewrite(bias_prompt, "Rewrote content in neutral language"),
    ),
    (
        FailureMode::Manipulation,
        Strategy::Local(
            mitigate_manipulation,
            "Stripped injected instructions, encoded runs and role headers",
        ),
    ),
];

fn strategy_for(mode: FailureMode) -> Option<Strategy> {
    STRATEGIES
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, s)| *s)
}

/// Applies per-mode corrective strategies to content.
#[derive(Clone)]
pub struct ContextMitigator {
    detector: ContextDetector,
    model: Option<Arc<dyn LanguageModel>>,
    config: QualityConfig,
}

impl ContextMitigator {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            detector: ContextDetector::new(),
            model: None,
            config,
        }
    }

    /// Use `model` for rewrite strategies and the polish pass.
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Mitigate every detected mode, most severe first, then polish.
    ///
    /// # Arguments
    /// * `content` - The original content
    /// * `detections` - Detector verdicts for `content`; only detected modes are acted on
    ///
    /// # Returns
    /// The mitigated content, one action per processed mode, a change log and
    /// the change in overall score measured by re-running the detector.
    pub async fn mitigate(&self, content: &str, detections: &[FailureDetection]) -> MitigationReport {
        let ordered = most_severe_first(detections);
        if ordered.is_empty() {
            return MitigationReport::unchanged(content);
        }

        let mut text = content.to_string();
        let mut actions = Vec::with_capacity(ordered.len());
        let mut change_log = Vec::new();

        for detection in &ordered {
            let action = match strategy_for(detection.mode) {
                Some(Strategy::Local(apply, description)) => {
                    apply_local(detection, apply, description, &mut text)
                }
                Some(Strategy::Rewrite(prompt, description)) => {
                    let metrics = compute_metrics(&tokenize(&text));
                    let prompt = prompt(&text, &metrics);
                    match self.rewrite(detection.mode, &prompt).await {
                        Some(out) if out != text => {
                            text = out;
                            MitigationAction::new(detection.mode, description, 1)
                                .with_reduction(detection.severity * 0.5)
                        }
                        _ => MitigationAction::new(detection.mode, description, 0),
                    }
                }
                None => MitigationAction::new(detection.mode, "No strategy", 0),
            };
            if action.changed() {
                change_log.push(log_entry(&action));
            }
            actions.push(action);
        }

        if !change_log.is_empty() && self.config.polish_enabled && self.model.is_some() {
            let prompt = format!(
                "Polish the following text so it reads naturally without changing its meaning. \
                 Edits already made: {}.\n\nText:\n{}",
                change_log.join("; "),
                text
            );
            if let Some(out) = self.rewrite_with("polish", &prompt).await {
                if out != text {
                    text = out;
                    change_log.push("polish: smoothed wording after mitigation".to_string());
                }
            }
        }

        self.finish(content, text, actions, change_log)
    }

    /// Apply only the model-free strategies. Rewrite strategies are recorded
    /// with zero changes.
    pub fn mitigate_local(&self, content: &str, detections: &[FailureDetection]) -> MitigationReport {
        let ordered = most_severe_first(detections);
        if ordered.is_empty() {
            return MitigationReport::unchanged(content);
        }

        let mut text = content.to_string();
        let mut actions = Vec::with_capacity(ordered.len());
        let mut change_log = Vec::new();

        for detection in &ordered {
            let action = match strategy_for(detection.mode) {
                Some(Strategy::Local(apply, description)) => {
                    apply_local(detection, apply, description, &mut text)
                }
                Some(Strategy::Rewrite(_, description)) => {
                    MitigationAction::new(detection.mode, description, 0)
                }
                None => MitigationAction::new(detection.mode, "No strategy", 0),
            };
            if action.changed() {
                change_log.push(log_entry(&action));
            }
            actions.push(action);
        }

        self.finish(content, text, actions, change_log)
    }

    fn finish(
        &self,
        original: &str,
        text: String,
        actions: Vec<MitigationAction>,
        change_log: Vec<String>,
    ) -> MitigationReport {
        if text == original {
            return MitigationReport {
                mitigated_content: text,
                actions,
                change_log: Vec::new(),
                improvement_score: 0.0,
            };
        }
        let before = self.detector.analyze(original).overall_score;
        let after = self.detector.analyze(&text).overall_score;
        tracing::info!(
            modes = actions.len(),
            changes = change_log.len(),
            before,
            after,
            "Mitigation applied"
        );
        MitigationReport {
            mitigated_content: text,
            actions,
            change_log,
            improvement_score: after - before,
        }
    }

    async fn rewrite(&self, mode: FailureMode, prompt: &str) -> Option<String> {
        if self.model.is_none() {
            tracing::warn!(mode = %mode, "No language model configured; skipping rewrite");
            return None;
        }
        self.rewrite_with(mode.as_str(), prompt).await
    }

    async fn rewrite_with(&self, purpose: &str, prompt: &str) -> Option<String> {
        let model = self.model.as_ref()?;
        let options = GenerateOptions::default()
            .with_temperature(0.2)
            .with_max_tokens(self.config.rewrite_max_tokens);
        match model
            .generate(&self.config.rewrite_model, prompt, &options)
            .await
        {
            Ok(out) => {
                let out = out.trim();
                if out.is_empty() {
                    tracing::warn!(purpose, "Language model returned an empty rewrite");
                    None
                } else {
                    Some(out.to_string())
                }
            }
            Err(e) => {
                tracing::warn!(
                    purpose,
                    provider = model.provider_id(),
                    error = %e,
                    "Language model rewrite failed; keeping content"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for ContextMitigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextMitigator")
            .field("model", &self.model.as_ref().map(|m| m.provider_id()))
            .field("config", &self.config)
            .finish()
    }
}

fn apply_local(
    detection: &FailureDetection,
    apply: LocalFn,
    description: &str,
    text: &mut String,
) -> MitigationAction {
    let (out, changes) = apply(text);
    if changes > 0 && out != *text {
        *text = out;
        MitigationAction::new(detection.mode, description, changes)
            .with_reduction((0.1 * changes as f64).min(detection.severity))
    } else {
        MitigationAction::new(detection.mode, description, 0)
    }
}

fn log_entry(action: &MitigationAction) -> String {
    format!(
        "{}: {} ({} change{})",
        action.mode,
        action.description,
        action.changes_applied,
        if action.changes_applied == 1 { "" } else { "s" }
    )
}

/// Detected modes, one per mode (highest severity wins), ordered by
/// descending severity with ties in canonical mode order.
fn most_severe_first(detections: &[FailureDetection]) -> Vec<FailureDetection> {
    let mut by_mode: Vec<FailureDetection> = Vec::new();
    for d in detections.iter().filter(|d| d.detected) {
        match by_mode.iter_mut().find(|e| e.mode == d.mode) {
            Some(existing) if existing.severity < d.severity => *existing = d.clone(),
            Some(_) => {}
            None => by_mode.push(d.clone()),
        }
    }
    by_mode.sort_by(|a, b| {
        b.severity
            .partial_cmp(&a.severity)
            .unwrap_or(Ordering::Equal)
            .then(a.mode.cmp(&b.mode))
    });
    by_mode
}

// ============================================================================
// LOCAL STRATEGIES
// ============================================================================

fn downgrade(word: &str) -> String {
    let lower = word.to_lowercase();
    let replacement = ABSOLUTE_DOWNGRADES
        .iter()
        .find(|(w, _)| *w == lower)
        .map(|(_, r)| *r)
        .unwrap_or(word);
    match word.chars().next() {
        Some(first) if first.is_uppercase() => {
            let mut chars = replacement.chars();
            chars
                .next()
                .map(|c| c.to_uppercase().chain(chars).collect())
                .unwrap_or_default()
        }
        _ => replacement.to_string(),
    }
}

fn mitigate_poisoning(text: &str) -> (String, usize) {
    let (out, phrases) = HALLUCINATION_PHRASES.replace_all(text, "");
    let (out, absolutes) = ABSOLUTE_WORDS.replace_with(&out, |caps| downgrade(&caps[0]));

    let mut clamped = 0;
    let (out, _) = PERCENTAGE.replace_with(&out, |caps| {
        let value: f64 = caps[1].parse().unwrap_or(0.0);
        if value > MAX_PLAUSIBLE_PERCENT {
            clamped += 1;
            format!("{MAX_PLAUSIBLE_PERCENT}%")
        } else {
            caps[0].to_string()
        }
    });

    let changes = phrases + absolutes + clamped;
    if changes == 0 {
        (text.to_string(), 0)
    } else {
        (tidy(&out), changes)
    }
}

fn mitigate_confusion(text: &str) -> (String, usize) {
    let sentences = split_sentences(text);
    let dropped: BTreeSet<usize> = contradictory_pairs(&sentences)
        .into_iter()
        .map(|(_, later)| later)
        .collect();
    if dropped.is_empty() {
        return (text.to_string(), 0);
    }
    let out = rejoin(text, &sentences, |i| !dropped.contains(&i));
    (out, dropped.len())
}

fn mitigate_repetition(text: &str) -> (String, usize) {
    let sentences = split_sentences(text);
    let mut kept: BTreeSet<usize> = BTreeSet::new();
    let mut kept_words: Vec<HashSet<String>> = Vec::new();
    let mut removed = 0;

    for (i, sentence) in sentences.iter().enumerate() {
        let words: HashSet<String> = tokenize(sentence).into_iter().collect();
        let duplicate = kept_words
            .iter()
            .any(|seen| crate::metrics::jaccard(seen, &words) > DUPLICATE_SIMILARITY);
        if duplicate {
            removed += 1;
        } else {
            kept.insert(i);
            kept_words.push(words);
        }
    }

    let deduped = if removed > 0 {
        rejoin(text, &sentences, |i| kept.contains(&i))
    } else {
        text.to_string()
    };
    let (collapsed_text, collapsed) = collapse_repeated_trigrams(&deduped);

    match (removed, collapsed) {
        (0, 0) => (text.to_string(), 0),
        (_, 0) => (deduped, removed),
        _ => (collapsed_text, removed + collapsed),
    }
}

/// Drop 3-word phrases the detector would flag.
///
/// A phrase is dropped when it immediately repeats the kept text before it,
/// or when it is one of the detector's repeated trigrams and has already
/// been kept [`MAX_TRIGRAM_REPEATS`] times anywhere earlier in the text.
fn collapse_repeated_trigrams(text: &str) -> (String, usize) {
    fn norm(word: &str) -> String {
        word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase()
    }

    let flagged: HashSet<String> = repeated_trigrams(&tokenize(text))
        .into_iter()
        .map(|(gram, _)| gram)
        .collect();
    let words: Vec<&str> = text.split_whitespace().collect();
    let normed: Vec<String> = words.iter().map(|w| norm(w)).collect();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<usize> = Vec::with_capacity(words.len());
    let mut collapsed = 0;
    let mut i = 0;

    while i < words.len() {
        if i + 3 <= words.len() {
            let adjacent = kept.len() >= 3
                && (0..3).all(|k| normed[kept[kept.len() - 3 + k]] == normed[i + k]);
            let drop = adjacent || {
                let gram = normed[i..i + 3].join(" ");
                flagged.contains(&gram) && {
                    let count = seen.entry(gram).or_default();
                    *count += 1;
                    *count > MAX_TRIGRAM_REPEATS
                }
            };
            if drop {
                collapsed += 1;
                i += 3;
                continue;
            }
        }
        kept.push(i);
        i += 1;
    }

    if collapsed == 0 {
        return (text.to_string(), 0);
    }
    let kept: HashSet<usize> = kept.into_iter().collect();
    (rejoin(text, &words, |i| kept.contains(&i)), collapsed)
}

/// Rebuild `text` from the `pieces` accepted by `keep`.
///
/// `pieces` must be in-order slices of `text`. Each kept piece after the
/// first is preceded by the separator that preceded it in `text`, so line
/// and paragraph breaks survive.
fn rejoin(text: &str, pieces: &[&str], keep: impl Fn(usize) -> bool) -> String {
    let base = text.as_ptr() as usize;
    let mut out = String::with_capacity(text.len());
    let mut prev_end = 0;

    for (i, piece) in pieces.iter().enumerate() {
        let start = (piece.as_ptr() as usize).saturating_sub(base);
        let gap = text.get(prev_end..start).unwrap_or(" ");
        prev_end = start + piece.len();
        if !keep(i) {
            continue;
        }
        if !out.is_empty() {
            out.push_str(if gap.is_empty() { " " } else { gap });
        }
        out.push_str(piece);
    }
    out
}

fn mitigate_manipulation(text: &str) -> (String, usize) {
    let mut headers = 0;
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| {
            let header = ROLE_HEADER_LINE.is_match(line);
            if header {
                headers += 1;
            }
            !header
        })
        .collect();
    let out = kept.join("\n");

    let (out, jailbreaks) = JAILBREAK_PATTERNS.replace_all(&out, "");
    let (out, blobs) = ENCODED_BLOBS.replace_all(&out, "");
    let (out, delimiters) = INJECTION_DELIMITERS.replace_all(&out, "");

    let changes = headers + jailbreaks + blobs + delimiters;
    if changes == 0 {
        (text.to_string(), 0)
    } else {
        (tidy(&out), changes)
    }
}

// ============================================================================
// REWRITE PROMPTS
// ============================================================================

fn distraction_prompt(text: &str, metrics: &ContextMetrics) -> String {
    let topic = metrics
        .dominant_topic()
        .map(|(t, _)| t)
        .unwrap_or("the main subject");
    format!(
        "Rewrite the following content so it focuses only on \"{topic}\". \
         Drop material unrelated to that topic.\n\nContent:\n{text}"
    )
}

fn clash_prompt(text: &str, _metrics: &ContextMetrics) -> String {
    format!(
        "The following content contains instructions that conflict with each other. \
         Rewrite it as one consistent set of instructions, stating which rule takes \
         precedence where they disagree.\n\nContent:\n{text}"
    )
}

fn incoherence_prompt(text: &str, _metrics: &ContextMetrics) -> String {
    format!(
        "Rewrite the following content as clear, complete sentences in a logical order. \
         Keep every fact it states.\n\nContent:\n{text}"
    )
}

fn bias_prompt(text: &str, _metrics: &ContextMetrics) -> String {
    format!(
        "Rewrite the following content in neutral, respectful language. Remove insults \
         and one-sided framing while keeping the factual claims.\n\nContent:\n{text}"
    )
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_content_without_detections_roundtrips(text in "[a-z]{1,8}( [a-z]{1,8}){0,20}\\.?") {
            let report = ContextDetector::new().analyze(&text);
            prop_assume!(!report.has_detections());

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let mitigated = rt.block_on(
                ContextMitigator::new(QualityConfig::default()).mitigate(&text, &report.detections),
            );
            prop_assert_eq!(&mitigated.mitigated_content, &text);
            prop_assert!(mitigated.change_log.is_empty());
            prop_assert_eq!(mitigated.improvement_score, 0.0);
        }

        #[test]
        fn prop_reduction_capped(text in ".{0,200}") {
            let detections = ContextDetector::new().analyze(&text).detections;
            let report = ContextMitigator::new(QualityConfig::default())
                .mitigate_local(&text, &detections);
            for action in &report.actions {
                prop_assert!((0.0..=MitigationAction::MAX_REDUCTION).contains(&action.severity_reduction));
            }
        }
    }
}
