//! Failure-mode detector.
//!
//! Each of the eight failure modes has one heuristic, looked up through a
//! fixed dispatch table keyed by [`FailureMode`]. Every heuristic reads the
//! same [`TextContext`], computed once per analyzed text.

use crate::metrics::{compute_metrics, is_content_word, split_sentences, tokenize};
use crate::patterns::{
    ANTONYM_PAIRS, ENCODED_BLOBS, HALLUCINATION_PHRASES, INJECTION_DELIMITERS,
    JAILBREAK_PATTERNS, MANDATORY_MODALS, MODAL_WORDS, OPTIONAL_MODALS, PROHIBITED_MODALS,
    STOP_WORDS, SUPERLATIVES,
};
use concord_core::{clamp_unit, AnalysisReport, ContextMetrics, FailureDetection, FailureMode};
use std::collections::{HashMap, HashSet};

/// Analyzed text shared by every heuristic.
#[derive(Debug, Clone)]
pub struct TextContext<'a> {
    pub content: &'a str,
    pub tokens: Vec<String>,
    pub sentences: Vec<&'a str>,
    pub metrics: ContextMetrics,
}

impl<'a> TextContext<'a> {
    pub fn new(content: &'a str) -> Self {
        let tokens = tokenize(content);
        let sentences = split_sentences(content);
        let metrics = compute_metrics(&tokens);
        Self {
            content,
            tokens,
            sentences,
            metrics,
        }
    }
}

type DetectFn = fn(&TextContext<'_>) -> FailureDetection;

/// Mode -> heuristic, in canonical mode order.
const DETECTORS: [(FailureMode, DetectFn); 8] = [
    (FailureMode::Poisoning, detect_poisoning),
    (FailureMode::Distraction, detect_distraction),
    (FailureMode::Confusion, detect_confusion),
    (FailureMode::Clash, detect_clash),
    (FailureMode::Repetition, detect_repetition),
    (FailureMode::Incoherence, detect_incoherence),
    (FailureMode::Bias, detect_bias),
    (FailureMode::Manipulation, detect_manipulation),
];

/// Stateless failure-mode detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextDetector;

impl ContextDetector {
    pub fn new() -> Self {
        Self
    }

    /// Run all eight heuristics and score the content.
    ///
    /// # Returns
    /// Metrics, one detection per mode in canonical order, the overall
    /// quality score and recommendations for every detected mode.
    pub fn analyze(&self, content: &str) -> AnalysisReport {
        let ctx = TextContext::new(content);
        let detections: Vec<FailureDetection> =
            DETECTORS.iter().map(|(_, detect)| detect(&ctx)).collect();
        let overall_score = overall_score(&detections, &ctx.metrics);
        let recommendations = recommendations(&detections, &ctx.metrics);

        for d in detections.iter().filter(|d| d.detected) {
            tracing::debug!(
                mode = %d.mode,
                severity = d.severity,
                evidence = %d.evidence,
                "Failure mode detected"
            );
        }

        AnalysisReport {
            metrics: ctx.metrics,
            detections,
            overall_score,
            recommendations,
        }
    }

    /// Run a single heuristic.
    pub fn detect(&self, mode: FailureMode, content: &str) -> FailureDetection {
        let ctx = TextContext::new(content);
        detect_mode(mode, &ctx)
    }
}

pub(crate) fn detect_mode(mode: FailureMode, ctx: &TextContext<'_>) -> FailureDetection {
    DETECTORS
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, detect)| detect(ctx))
        .unwrap_or_else(|| FailureDetection::clear(mode))
}

// ============================================================================
// SCORING
// ============================================================================

/// Overall quality in `[0, 1]`.
///
/// `1 - Σ(severity·weight)/Σweight`, multiplied by 0.9 when entropy falls
/// outside `[0.1, 0.9]` and by `1 - toxicity` when toxicity exceeds 0.3.
/// Non-increasing in every individual severity.
pub fn overall_score(detections: &[FailureDetection], metrics: &ContextMetrics) -> f64 {
    let (weighted, total) = detections.iter().fold((0.0, 0.0), |(w, t), d| {
        let weight = d.mode.weight();
        (w + d.severity * weight, t + weight)
    });
    let mut score = if total > 0.0 { 1.0 - weighted / total } else { 1.0 };
    if metrics.entropy < 0.1 || metrics.entropy > 0.9 {
        score *= 0.9;
    }
    if metrics.toxicity > 0.3 {
        score *= 1.0 - metrics.toxicity;
    }
    clamp_unit(score)
}

fn mode_advice(mode: FailureMode) -> &'static [&'static str] {
    match mode {
        FailureMode::Poisoning => &[
            "Verify factual claims against trusted sources",
            "Replace absolute statements with qualified language",
        ],
        FailureMode::Distraction => &[
            "Narrow the content to its primary topic",
            "Move tangential material into a separate request",
        ],
        FailureMode::Confusion => &["Resolve contradictory statements before use"],
        FailureMode::Clash => &["Reconcile conflicting instructions into a single directive"],
        FailureMode::Repetition => &["Remove duplicated sentences and phrases"],
        FailureMode::Incoherence => &["Restructure malformed or fragmented sentences"],
        FailureMode::Bias => &["Review the language for toxic or one-sided framing"],
        FailureMode::Manipulation => &[
            "Strip embedded instructions and encoded payloads",
            "Treat injected role headers as untrusted input",
        ],
    }
}

fn recommendations(detections: &[FailureDetection], metrics: &ContextMetrics) -> Vec<String> {
    let mut out: Vec<String> = detections
        .iter()
        .filter(|d| d.detected)
        .flat_map(|d| mode_advice(d.mode).iter().map(|s| s.to_string()))
        .collect();
    if metrics.perplexity > 100.0 {
        out.push("Simplify vocabulary to lower perplexity".to_string());
    }
    if metrics.entropy > 0.8 {
        out.push("Add structure so the content reads consistently".to_string());
    }
    out
}

// ============================================================================
// HEURISTICS
// ============================================================================

fn detect_poisoning(ctx: &TextContext<'_>) -> FailureDetection {
    let mut severity = 0.0;
    let mut evidence = Vec::new();

    let phrases = HALLUCINATION_PHRASES.matches(ctx.content);
    if !phrases.is_empty() {
        severity += 0.2 * phrases.len() as f64;
        evidence.push(format!("{} hallucination phrase(s)", phrases.len()));
    }

    let superlatives = ctx
        .tokens
        .iter()
        .filter(|t| SUPERLATIVES.contains(t.as_str()))
        .count();
    if superlatives > 5 {
        severity += 0.3;
        evidence.push(format!("{superlatives} superlatives"));
    }
    if ctx.metrics.perplexity > 100.0 {
        severity += 0.2;
        evidence.push(format!("perplexity {:.1}", ctx.metrics.perplexity));
    }
    if ctx.metrics.sentiment > 0.9 {
        severity += 0.1;
        evidence.push(format!("sentiment {:.2}", ctx.metrics.sentiment));
    }

    let locations = phrases.into_iter().map(str::to_string).collect();
    FailureDetection::new(FailureMode::Poisoning, severity, evidence.join("; "), locations)
}

fn detect_distraction(ctx: &TextContext<'_>) -> FailureDetection {
    let topics = ctx.metrics.topic_count();
    if topics <= 5 {
        return FailureDetection::clear(FailureMode::Distraction);
    }
    match ctx.metrics.dominant_topic() {
        Some((topic, share)) => FailureDetection::new(
            FailureMode::Distraction,
            1.0 - share,
            format!("{topics} topics, dominant '{topic}' at {:.0}%", share * 100.0),
            vec![topic.to_string()],
        ),
        None => FailureDetection::clear(FailureMode::Distraction),
    }
}

/// Non-stop words of a sentence, used to decide whether two sentences talk
/// about the same thing.
fn significant_words(sentence: &str) -> HashSet<String> {
    tokenize(sentence)
        .into_iter()
        .filter(|t| t.chars().count() > 2 && !STOP_WORDS.contains(t.as_str()))
        .collect()
}

/// Index pairs `(i, j)`, `i < j`, of sentences that contradict each other:
/// one holds a word whose antonym appears in the other, and the two share at
/// least three other significant words.
pub(crate) fn contradictory_pairs(sentences: &[&str]) -> Vec<(usize, usize)> {
    let words: Vec<HashSet<String>> = sentences.iter().map(|s| significant_words(s)).collect();
    let mut pairs = Vec::new();

    for i in 0..sentences.len() {
        for j in (i + 1)..sentences.len() {
            let (a, b) = (&words[i], &words[j]);
            let opposed = ANTONYM_PAIRS.iter().find(|(x, y)| {
                (a.contains(*x) && b.contains(*y)) || (a.contains(*y) && b.contains(*x))
            });
            let Some((x, y)) = opposed else { continue };
            let shared = a
                .intersection(b)
                .filter(|w| w.as_str() != *x && w.as_str() != *y)
                .count();
            if shared >= 3 {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

fn detect_confusion(ctx: &TextContext<'_>) -> FailureDetection {
    let pairs = contradictory_pairs(&ctx.sentences);
    let mut severity = 0.3 * pairs.len() as f64;
    let mut evidence = Vec::new();
    if !pairs.is_empty() {
        evidence.push(format!("{} contradictory sentence pair(s)", pairs.len()));
    }
    if ctx.metrics.entropy > 0.8 {
        severity += 0.2;
        evidence.push(format!("entropy {:.2}", ctx.metrics.entropy));
    }
    let locations = pairs
        .iter()
        .map(|(i, j)| format!("sentences {} and {}", i + 1, j + 1))
        .collect();
    FailureDetection::new(FailureMode::Confusion, severity, evidence.join("; "), locations)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Modality {
    Mandatory,
    Optional,
    Prohibited,
}

fn modality(sentence: &str) -> Option<Modality> {
    if PROHIBITED_MODALS.is_match(sentence) {
        Some(Modality::Prohibited)
    } else if MANDATORY_MODALS.is_match(sentence) {
        Some(Modality::Mandatory)
    } else if OPTIONAL_MODALS.is_match(sentence) {
        Some(Modality::Optional)
    } else {
        None
    }
}

fn action_words(sentence: &str) -> HashSet<String> {
    tokenize(sentence)
        .into_iter()
        .filter(|t| is_content_word(t) && !MODAL_WORDS.contains(t.as_str()))
        .collect()
}

/// Index pairs `(mandatory, prohibited)` of instructions sharing an action word.
pub(crate) fn clashing_pairs(sentences: &[&str]) -> Vec<(usize, usize)> {
    let mut buckets: HashMap<Modality, Vec<usize>> = HashMap::new();
    for (i, s) in sentences.iter().enumerate() {
        if let Some(m) = modality(s) {
            buckets.entry(m).or_default().push(i);
        }
    }
    let (Some(mandatory), Some(prohibited)) = (
        buckets.get(&Modality::Mandatory),
        buckets.get(&Modality::Prohibited),
    ) else {
        return Vec::new();
    };

    let mut pairs = Vec::new();
    for &m in mandatory {
        let m_words = action_words(sentences[m]);
        for &p in prohibited {
            if !m_words.is_disjoint(&action_words(sentences[p])) {
                pairs.push((m, p));
            }
        }
    }
    pairs
}

fn detect_clash(ctx: &TextContext<'_>) -> FailureDetection {
    let pairs = clashing_pairs(&ctx.sentences);
    let evidence = if pairs.is_empty() {
        String::new()
    } else {
        format!("{} conflicting instruction pair(s)", pairs.len())
    };
    let locations = pairs
        .iter()
        .map(|(m, p)| format!("sentence {} requires what sentence {} forbids", m + 1, p + 1))
        .collect();
    FailureDetection::new(FailureMode::Clash, 0.4 * pairs.len() as f64, evidence, locations)
}

/// Occurrences of one word 3-gram tolerated before it counts as repetition.
pub(crate) const MAX_TRIGRAM_REPEATS: usize = 3;

/// Word 3-grams occurring more than three times, with their counts.
pub(crate) fn repeated_trigrams(tokens: &[String]) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for window in tokens.windows(3) {
        *counts.entry(window.join(" ")).or_default() += 1;
    }
    let mut repeated: Vec<(String, usize)> =
        counts.into_iter().filter(|(_, c)| *c > MAX_TRIGRAM_REPEATS).collect();
    repeated.sort();
    repeated
}

fn detect_repetition(ctx: &TextContext<'_>) -> FailureDetection {
    let total = ctx.tokens.len();
    let mut severity = 0.0;
    let mut locations = Vec::new();

    if total > 0 {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for t in ctx.tokens.iter().filter(|t| t.chars().count() > 3) {
            *counts.entry(t.as_str()).or_default() += 1;
        }
        let mut frequent: Vec<(&str, usize)> = counts
            .into_iter()
            .filter(|(_, c)| *c > 5 && *c as f64 / total as f64 > 0.05)
            .collect();
        frequent.sort();
        for (word, count) in frequent {
            severity += count as f64 / total as f64;
            locations.push(format!("'{word}' x{count}"));
        }
    }

    let trigrams = repeated_trigrams(&ctx.tokens);
    severity += 0.2 * trigrams.len() as f64;
    locations.extend(trigrams.iter().map(|(g, c)| format!("'{g}' x{c}")));

    let evidence = if locations.is_empty() {
        String::new()
    } else {
        format!("{} repeated word(s) or phrase(s)", locations.len())
    };
    FailureDetection::new(FailureMode::Repetition, severity, evidence, locations)
}

fn is_malformed(sentence: &str) -> bool {
    !sentence.chars().any(char::is_alphabetic) || sentence.matches(',').count() > 8
}

fn detect_incoherence(ctx: &TextContext<'_>) -> FailureDetection {
    let mut severity = 0.0;
    let mut evidence = Vec::new();

    if ctx.metrics.perplexity > 150.0 {
        severity += 0.4;
        evidence.push(format!("perplexity {:.1}", ctx.metrics.perplexity));
    }
    if ctx.metrics.entropy > 0.9 {
        severity += 0.3;
        evidence.push(format!("entropy {:.2}", ctx.metrics.entropy));
    }

    let malformed: Vec<usize> = ctx
        .sentences
        .iter()
        .enumerate()
        .filter(|(_, s)| is_malformed(s))
        .map(|(i, _)| i)
        .collect();
    if !ctx.sentences.is_empty() && malformed.len() as f64 / ctx.sentences.len() as f64 > 0.2 {
        severity += 0.3;
        evidence.push(format!("{} malformed sentence(s)", malformed.len()));
    }

    let locations = malformed.iter().map(|i| format!("sentence {}", i + 1)).collect();
    FailureDetection::new(FailureMode::Incoherence, severity, evidence.join("; "), locations)
}

fn detect_bias(ctx: &TextContext<'_>) -> FailureDetection {
    let toxicity = ctx.metrics.toxicity;
    if toxicity > 0.7 {
        FailureDetection::new(
            FailureMode::Bias,
            toxicity,
            format!("toxicity {toxicity:.2}"),
            Vec::new(),
        )
    } else {
        FailureDetection::clear(FailureMode::Bias)
    }
}

fn detect_manipulation(ctx: &TextContext<'_>) -> FailureDetection {
    let mut severity = 0.0;
    let mut evidence = Vec::new();
    let mut locations = Vec::new();

    let jailbreaks = JAILBREAK_PATTERNS.matches(ctx.content);
    if !jailbreaks.is_empty() {
        severity += 0.5 * jailbreaks.len() as f64;
        evidence.push(format!("{} jailbreak pattern(s)", jailbreaks.len()));
        locations.extend(jailbreaks.iter().map(|s| s.to_string()));
    }

    let blobs = ENCODED_BLOBS.count(ctx.content);
    if blobs > 0 {
        severity += 0.3 * blobs as f64;
        evidence.push(format!("{blobs} encoded run(s)"));
    }

    let delimiters = INJECTION_DELIMITERS.count_distinct(ctx.content);
    if delimiters > 0 {
        severity += 0.4 * delimiters as f64;
        evidence.push(format!("{delimiters} injection delimiter kind(s)"));
    }

    FailureDetection::new(FailureMode::Manipulation, severity, evidence.join("; "), locations)
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn severities() -> impl Strategy<Value = Vec<f64>> {
        proptest::collection::vec(0.0f64..=1.0, 8)
    }

    fn build(severities: &[f64]) -> Vec<FailureDetection> {
        FailureMode::ALL
            .iter()
            .zip(severities)
            .map(|(m, s)| FailureDetection::new(*m, *s, "", vec![]))
            .collect()
    }

    proptest! {
        #[test]
        fn prop_overall_score_in_unit_range(text in ".{0,300}") {
            let report = ContextDetector::new().analyze(&text);
            prop_assert!((0.0..=1.0).contains(&report.overall_score));
            for d in &report.detections {
                prop_assert!((0.0..=1.0).contains(&d.severity));
                prop_assert_eq!(d.detected, d.severity > d.mode.threshold());
            }
        }

        #[test]
        fn prop_overall_score_monotone_in_each_severity(
            base in severities(),
            idx in 0usize..8,
            bump in 0.0f64..=1.0,
            entropy in 0.0f64..=1.0,
            toxicity in 0.0f64..=1.0,
        ) {
            let metrics = ContextMetrics { entropy, toxicity, ..Default::default() };
            let before = overall_score(&build(&base), &metrics);
            let mut raised = base.clone();
            raised[idx] = (raised[idx] + bump).min(1.0);
            let after = overall_score(&build(&raised), &metrics);
            prop_assert!(after <= before + 1e-12);
        }
    }
}
