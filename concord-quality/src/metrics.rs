//! Text statistics: tokens, sentences, entropy, sentiment, toxicity.

use crate::patterns::{NEGATIVE_WORDS, POSITIVE_WORDS, STOP_WORDS, TOXIC_WORDS};
use concord_core::{clamp_unit, ContextMetrics};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Lowercased word tokens. Apostrophes inside words are kept (`don't`).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Split text into trimmed sentences.
///
/// A sentence ends at a newline or at a run of `.`, `!` or `?` followed by
/// whitespace or end of text, so decimals like `3.5` stay intact.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let end = match c {
            '\n' => Some(i),
            '.' | '!' | '?' => {
                let mut last = i + c.len_utf8();
                while let Some(&(j, n)) = chars.peek() {
                    if matches!(n, '.' | '!' | '?') {
                        last = j + n.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                match chars.peek() {
                    None => Some(last),
                    Some(&(_, n)) if n.is_whitespace() => Some(last),
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(end) = end {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Whether a token carries meaning: longer than three characters and not a
/// stop word.
pub fn is_content_word(token: &str) -> bool {
    token.chars().count() > 3 && !STOP_WORDS.contains(token)
}

/// Distinct content words of a text.
pub fn content_words(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| is_content_word(t))
        .collect()
}

/// Jaccard similarity of two word sets. Two empty sets are identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Compute [`ContextMetrics`] from an already tokenized text.
pub fn compute_metrics(tokens: &[String]) -> ContextMetrics {
    let total = tokens.len();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in tokens {
        *counts.entry(t.as_str()).or_default() += 1;
    }
    let unique = counts.len();

    let raw_entropy = if total == 0 {
        0.0
    } else {
        counts
            .values()
            .map(|&c| {
                let p = c as f64 / total as f64;
                -p * p.log2()
            })
            .sum::<f64>()
    };
    let entropy = if unique > 1 {
        clamp_unit(raw_entropy / (unique as f64).log2())
    } else {
        0.0
    };
    let perplexity = raw_entropy.exp2();

    let topic_distribution: BTreeMap<String, usize> = counts
        .iter()
        .filter(|(word, &count)| count >= 2 && is_content_word(word))
        .map(|(word, &count)| (word.to_string(), count))
        .collect();

    let positive = tokens.iter().filter(|t| POSITIVE_WORDS.contains(t.as_str())).count();
    let negative = tokens.iter().filter(|t| NEGATIVE_WORDS.contains(t.as_str())).count();
    let sentiment =
        ((positive as f64 - negative as f64) / (positive + negative + 1) as f64).clamp(-1.0, 1.0);

    let toxic = tokens.iter().filter(|t| TOXIC_WORDS.contains(t.as_str())).count();
    let toxicity = if total == 0 {
        0.0
    } else {
        clamp_unit(toxic as f64 / total as f64 * 5.0)
    };

    ContextMetrics {
        total_tokens: total,
        unique_tokens: unique,
        entropy,
        perplexity,
        topic_distribution,
        sentiment,
        toxicity,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Don't PANIC, it's 42!"),
            vec!["don't", "panic", "it's", "42"]
        );
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn test_split_sentences() {
        let s = split_sentences("First one. Second one!\nThird line? Pi is 3.14 ok");
        assert_eq!(s, vec!["First one.", "Second one!", "Third line?", "Pi is 3.14 ok"]);
    }

    #[test]
    fn test_split_sentences_keeps_ellipsis_together() {
        let s = split_sentences("Wait... what?! Fine");
        assert_eq!(s, vec!["Wait...", "what?!", "Fine"]);
    }

    #[test]
    fn test_empty_text_metrics() {
        let m = compute_metrics(&[]);
        assert_eq!(m.total_tokens, 0);
        assert_eq!(m.entropy, 0.0);
        assert_eq!(m.perplexity, 1.0);
        assert_eq!(m.toxicity, 0.0);
        assert_eq!(m.sentiment, 0.0);
    }

    #[test]
    fn test_uniform_tokens_have_full_entropy() {
        let m = compute_metrics(&tokenize("alpha beta gamma delta"));
        assert!((m.entropy - 1.0).abs() < 1e-9);
        assert!((m.perplexity - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_repeated_token_has_zero_entropy() {
        let m = compute_metrics(&tokenize("spam spam spam"));
        assert_eq!(m.unique_tokens, 1);
        assert_eq!(m.entropy, 0.0);
    }

    #[test]
    fn test_topics_require_two_occurrences() {
        let m = compute_metrics(&tokenize("rust rust async async the the bus"));
        assert_eq!(m.topic_distribution.get("rust"), Some(&2));
        assert_eq!(m.topic_distribution.get("async"), Some(&2));
        assert!(!m.topic_distribution.contains_key("the"));
        assert!(!m.topic_distribution.contains_key("bus"));
    }

    #[test]
    fn test_sentiment_sign() {
        assert!(compute_metrics(&tokenize("great excellent good")).sentiment > 0.0);
        assert!(compute_metrics(&tokenize("terrible awful bad")).sentiment < 0.0);
    }

    #[test]
    fn test_toxicity_scales() {
        let m = compute_metrics(&tokenize("you stupid idiot"));
        assert_eq!(m.toxicity, 1.0);
        let m = compute_metrics(&tokenize("a calm and friendly note about stupid bugs in code today"));
        assert!(m.toxicity > 0.0 && m.toxicity < 1.0);
    }

    #[test]
    fn test_jaccard() {
        let a = content_words("deploy the service tonight");
        let b = content_words("deploy service tonight");
        assert_eq!(jaccard(&a, &b), 1.0);
        let c = content_words("rollback database");
        assert_eq!(jaccard(&a, &c), 0.0);
    }
}
