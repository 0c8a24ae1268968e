//! Polish validation.
//!
//! The polish pass is the most failure-prone Writer call: models shorten
//! scenes, replace passages with meta-commentary ("the rest is the same"),
//! or rewrite endings that the critique already approved. A polish that
//! fails any guard is rejected and the pre-polish content stays canonical.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use sf_core::types::count_words;

const LAZY_WINDOW_CHARS: usize = 500;
const MIN_LENGTH_RATIO: f64 = 0.85;
const ENDING_WINDOW_WORDS: usize = 50;
const MIN_ENDING_OVERLAP: f64 = 0.30;

static LAZY_POLISH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)the rest (of the (scene|draft|text) )?(is|remains|stays) (the same|unchanged|as before)",
        r"(?i)i (won't|will not|shall not) repeat",
        r"(?i)maintaining the [\d,]+[\s-]?word",
        r"(?i)\[rest",
        r"(?i)\[remainder",
        r"(?i)\[unchanged",
        r"(?i)(continues|remains) (exactly )?as (in|per) the original",
        r"(?i)no (further )?changes (are )?(needed|made) (to|for) the (rest|remainder)",
        r"(?i)\.\.\.\s*\[",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

// ---------------------------------------------------------------------------
// PolishRejection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolishRejection {
    #[error("polish ends in meta-commentary: matched `{pattern}`")]
    LazyPolish { pattern: String },
    #[error("polish shrank the scene: {polished} words vs {original} pre-polish")]
    TooShort { original: usize, polished: usize },
    #[error("polish rewrote the ending: overlap {overlap:.2} below {MIN_ENDING_OVERLAP}")]
    EndingChanged { overlap: f64 },
}

/// Validate a polished scene against its pre-polish draft.
///
/// Rejects on: lazy-polish meta-commentary in the last 500 chars, a word
/// count below 85 % of the pre-polish draft, or a last-50-words token-set
/// overlap below 0.30.
pub fn validate_polish(original: &str, polished: &str) -> Result<(), PolishRejection> {
    let tail = last_chars(polished, LAZY_WINDOW_CHARS);
    for pattern in LAZY_POLISH_PATTERNS.iter() {
        if pattern.is_match(tail) {
            return Err(PolishRejection::LazyPolish {
                pattern: pattern.as_str().to_string(),
            });
        }
    }

    let original_words = count_words(original);
    let polished_words = count_words(polished);
    if (polished_words as f64) < MIN_LENGTH_RATIO * original_words as f64 {
        return Err(PolishRejection::TooShort {
            original: original_words,
            polished: polished_words,
        });
    }

    let overlap = ending_overlap(original, polished);
    if overlap < MIN_ENDING_OVERLAP {
        return Err(PolishRejection::EndingChanged { overlap });
    }

    Ok(())
}

/// Token-set overlap of the last 50 words of each text (Jaccard).
pub fn ending_overlap(original: &str, polished: &str) -> f64 {
    let a = ending_set(original);
    let b = ending_set(polished);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    intersection as f64 / union as f64
}

fn ending_set(text: &str) -> HashSet<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(ENDING_WINDOW_WORDS);
    words[start..]
        .iter()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

fn last_chars(text: &str, n: usize) -> &str {
    let start = text
        .char_indices()
        .rev()
        .take(n)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
