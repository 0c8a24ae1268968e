//! Overlap stripping and content sanitization.
//!
//! In beats mode and expansion the Writer is asked to continue a scene, but
//! models frequently echo part (or all) of the existing text before the new
//! material. Stripping anchors on the tail of the existing content and cuts
//! the continuation just after the echo.

use std::sync::LazyLock;

use regex::Regex;

const MIN_CONTINUATION_TOKENS: usize = 100;
const MIN_REMAINDER_CHARS: usize = 100;
const PRIMARY_ANCHOR_TOKENS: usize = 50;
const SECONDARY_ANCHOR_TOKENS: usize = 30;
const PREFIX_AGREEMENT: f64 = 0.8;

/// Outcome of an overlap-strip attempt. The expansion loop needs to tell
/// "no echo detected" apart from "the continuation is nothing but echo".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StripOutcome {
    /// Echo found and removed; the new material follows.
    Stripped(String),
    /// Echo found, but nothing usable remains after it.
    WouldEmpty,
    /// No echo detected; the continuation stands as-is.
    NoOverlap,
}

/// Strip an echoed prefix from `continuation`, returning the continuation
/// unchanged when no confident strip applies.
///
/// - Continuations under 100 tokens are returned unchanged.
/// - The primary anchor is the last 50 tokens of `existing`; if it occurs
///   in the continuation (case-insensitive), everything after it is kept,
///   provided at least 100 characters remain.
/// - Failing that, if the continuation's opening tokens agree with
///   `existing`'s opening tokens at >= 80 %, a 30-token anchor is tried.
/// - If nothing applies, or stripping would leave (nearly) nothing, the
///   continuation is returned unchanged.
pub fn strip_overlap(existing: &str, continuation: &str) -> String {
    match try_strip(existing, continuation) {
        StripOutcome::Stripped(stripped) => stripped,
        StripOutcome::WouldEmpty => {
            tracing::debug!("overlap strip would empty the continuation, keeping unchanged");
            continuation.to_string()
        }
        StripOutcome::NoOverlap => continuation.to_string(),
    }
}

/// The strip decision itself; see [`strip_overlap`] for the rules.
pub fn try_strip(existing: &str, continuation: &str) -> StripOutcome {
    let cont_spans = token_spans(continuation);
    if cont_spans.len() < MIN_CONTINUATION_TOKENS {
        return StripOutcome::NoOverlap;
    }

    let existing_tokens = lower_tokens(existing);
    let cont_tokens: Vec<String> = cont_spans
        .iter()
        .map(|&(start, end)| continuation[start..end].to_lowercase())
        .collect();

    match strip_at_anchor(continuation, &cont_spans, &cont_tokens, &existing_tokens, PRIMARY_ANCHOR_TOKENS) {
        AnchorResult::Stripped(s) => return StripOutcome::Stripped(s),
        AnchorResult::Empty => return StripOutcome::WouldEmpty,
        AnchorResult::NotFound => {}
    }

    // Full-echo heuristic: the continuation starts by replaying the scene
    // from its beginning.
    let probe = MIN_CONTINUATION_TOKENS.min(existing_tokens.len() / 2);
    if probe > 0 && cont_tokens.len() >= probe {
        let matches = (0..probe)
            .filter(|&i| cont_tokens[i] == existing_tokens[i])
            .count();
        if matches as f64 / probe as f64 >= PREFIX_AGREEMENT {
            return match strip_at_anchor(
                continuation,
                &cont_spans,
                &cont_tokens,
                &existing_tokens,
                SECONDARY_ANCHOR_TOKENS,
            ) {
                AnchorResult::Stripped(s) => StripOutcome::Stripped(s),
                AnchorResult::Empty | AnchorResult::NotFound => StripOutcome::WouldEmpty,
            };
        }
    }

    StripOutcome::NoOverlap
}

enum AnchorResult {
    Stripped(String),
    Empty,
    NotFound,
}

fn strip_at_anchor(
    continuation: &str,
    cont_spans: &[(usize, usize)],
    cont_tokens: &[String],
    existing_tokens: &[String],
    anchor_len: usize,
) -> AnchorResult {
    if existing_tokens.is_empty() {
        return AnchorResult::NotFound;
    }
    let anchor_len = anchor_len.min(existing_tokens.len());
    let anchor = &existing_tokens[existing_tokens.len() - anchor_len..];

    let Some(position) = cont_tokens
        .windows(anchor_len)
        .position(|window| window == anchor)
    else {
        return AnchorResult::NotFound;
    };

    let after = position + anchor_len;
    if after >= cont_spans.len() {
        return AnchorResult::Empty;
    }
    let remainder = &continuation[cont_spans[after].0..];
    if remainder.trim().len() < MIN_REMAINDER_CHARS {
        tracing::debug!(
            remaining = remainder.trim().len(),
            "overlap strip remainder too small"
        );
        return AnchorResult::Empty;
    }
    AnchorResult::Stripped(remainder.to_string())
}

fn token_spans(s: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, ch) in s.char_indices() {
        if ch.is_whitespace() {
            if let Some(st) = start.take() {
                spans.push((st, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(st) = start {
        spans.push((st, s.len()));
    }
    spans
}

fn lower_tokens(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_lowercase).collect()
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

static WORD_COUNT_INLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\[\(]\s*word count:?\s*[\d,]+\s*(words)?\s*[\]\)]").expect("valid regex")
});

static WORD_COUNT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*word count:?\s*[\d,]+\s*(words)?\.?\s*$").expect("valid regex")
});

static TRIPLE_BLANK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Remove hallucinated word-count annotations and collapse tripled blank
/// lines. Applied to every block the Writer returns.
pub fn sanitize(content: &str) -> String {
    let without_inline = WORD_COUNT_INLINE.replace_all(content, "");
    let without_lines = WORD_COUNT_LINE.replace_all(&without_inline, "");
    let collapsed = TRIPLE_BLANK.replace_all(&without_lines, "\n\n");
    collapsed.trim().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize, prefix: &str) -> String {
        (0..n).map(|i| format!("{prefix}{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn short_continuations_pass_through() {
        let existing = words(200, "old");
        let continuation = "just a few new words";
        assert_eq!(strip_overlap(&existing, continuation), continuation);
    }

    #[test]
    fn echoed_tail_is_stripped() {
        let existing = words(200, "old");
        // Continuation echoes the last 60 tokens then adds new prose.
        let echo: Vec<String> = (140..200).map(|i| format!("old{i}")).collect();
        let fresh = words(120, "new");
        let continuation = format!("{} {}", echo.join(" "), fresh);

        let stripped = strip_overlap(&existing, &continuation);
        assert_eq!(stripped, fresh);
    }

    #[test]
    fn anchor_match_is_case_insensitive() {
        let existing = words(100, "old");
        let echo: Vec<String> = (50..100).map(|i| format!("OLD{i}")).collect();
        let fresh = words(120, "new");
        let continuation = format!("{} {}", echo.join(" "), fresh);

        assert_eq!(strip_overlap(&existing, &continuation), fresh);
    }

    #[test]
    fn unrelated_continuation_is_unchanged() {
        let existing = words(200, "old");
        let continuation = words(150, "new");
        assert_eq!(strip_overlap(&existing, &continuation), continuation);
    }

    #[test]
    fn stripping_that_would_empty_keeps_original() {
        let existing = words(200, "old");
        // Continuation is nothing but the echo.
        let echo: Vec<String> = (100..200).map(|i| format!("old{i}")).collect();
        let continuation = echo.join(" ");
        assert_eq!(strip_overlap(&existing, &continuation), continuation);
    }

    #[test]
    fn full_echo_is_stripped() {
        let existing = words(150, "old");
        // Continuation replays the entire scene, then continues.
        let fresh = words(120, "new");
        let continuation = format!("{} {}", existing, fresh);
        assert_eq!(strip_overlap(&existing, &continuation), fresh);
    }

    #[test]
    fn strip_is_idempotent() {
        let existing = words(200, "old");
        let echo: Vec<String> = (140..200).map(|i| format!("old{i}")).collect();
        let fresh = words(150, "new");
        let continuation = format!("{} {}", echo.join(" "), fresh);

        let once = strip_overlap(&existing, &continuation);
        let twice = strip_overlap(&existing, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn try_strip_distinguishes_empty_from_no_overlap() {
        let existing = words(200, "old");
        let echo: Vec<String> = (100..200).map(|i| format!("old{i}")).collect();
        assert_eq!(try_strip(&existing, &echo.join(" ")), StripOutcome::WouldEmpty);
        let fresh = words(150, "new");
        assert_eq!(try_strip(&existing, &fresh), StripOutcome::NoOverlap);
    }

    #[test]
    fn sanitize_removes_word_count_annotations() {
        let content = "The fog rolled in.\n\n[Word count: 1,234 words]\n\nShe waited.";
        let clean = sanitize(content);
        assert!(!clean.to_lowercase().contains("word count"));
        assert!(clean.contains("The fog rolled in."));
        assert!(clean.contains("She waited."));
    }

    #[test]
    fn sanitize_collapses_tripled_blank_lines() {
        let content = "one\n\n\n\n\ntwo";
        assert_eq!(sanitize(content), "one\n\ntwo");
    }

    #[test]
    fn sanitize_handles_standalone_lines() {
        let content = "The end.\nWord count: 900";
        assert_eq!(sanitize(content), "The end.");
    }
}
