//! Critic evaluation: approval, revision demand, and the server-side
//! compliance heuristics that override whatever the model claims.

use sf_core::types::{count_words, Critique, SceneOutline};

/// Score at or above which a critique approves outright and polish is
/// skipped. Shared so the two thresholds cannot drift apart.
pub const APPROVAL_SCORE: f64 = 8.0;

/// Minimum actual/target ratio for word-count compliance.
pub const WORD_COUNT_RATIO: f64 = 0.7;

const SCOPE_WINDOW_CHARS: usize = 500;
const HOOK_PROBE_WORDS: usize = 3;

const STOPWORDS: [&str; 28] = [
    "the", "a", "an", "of", "to", "and", "in", "on", "at", "is", "are", "was", "were", "it",
    "its", "his", "her", "their", "that", "this", "with", "for", "as", "by", "he", "she", "they",
    "from",
];

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CritiqueVerdict {
    pub approved: bool,
    pub revision_needed: bool,
}

/// Finalize a normalized critique against the actual draft.
///
/// Fills the server-side fields (`word_count_compliance`,
/// `scope_adherence`), then decides:
/// - the approval disjunction: `revision_needed == false`, `approved ==
///   true`, or `score >= 8`;
/// - the unconditional revision demands: failed compliance, failed scope,
///   `score < 7`, or any non-empty issues/revision requests.
///
/// A demand overrides approval; the canonical `revision_needed` is written
/// back into the critique.
pub fn finalize_critique(
    critique: &mut Critique,
    content: &str,
    target_words: usize,
    outline: &SceneOutline,
) -> CritiqueVerdict {
    let actual_words = count_words(content);
    let compliant = word_count_compliant(actual_words, target_words);
    let in_scope = scope_adherence(content, outline);
    critique.word_count_compliance = Some(compliant);
    critique.scope_adherence = Some(in_scope);

    let approval = critique.revision_needed == Some(false)
        || critique.approved == Some(true)
        || critique.score >= APPROVAL_SCORE;

    let demands = !compliant
        || !in_scope
        || critique.score < 7.0
        || (critique.score < APPROVAL_SCORE && !critique.issues.is_empty())
        || !critique.issues.is_empty()
        || !critique.revision_requests.is_empty();

    let approved = approval && !demands;
    critique.revision_needed = Some(!approved);
    if approved {
        critique.approved = Some(true);
    }

    CritiqueVerdict {
        approved,
        revision_needed: !approved,
    }
}

/// Pass iff `actual / target >= 0.7`. A zero target always passes.
pub fn word_count_compliant(actual: usize, target: usize) -> bool {
    if target == 0 {
        return true;
    }
    actual as f64 / target as f64 >= WORD_COUNT_RATIO
}

/// Server-side scope heuristic:
/// - the last 500 chars of the scene must mention at least one non-stopword
///   from the first three meaningful words of the declared hook;
/// - the scene must not mention any declared future event.
///
/// Scenes with no declared hook pass the first check vacuously.
pub fn scope_adherence(content: &str, outline: &SceneOutline) -> bool {
    let lowered = content.to_lowercase();

    if let Some(hook) = outline.hook.as_deref().filter(|h| !h.trim().is_empty()) {
        let probes: Vec<String> = meaningful_words(hook).take(HOOK_PROBE_WORDS).collect();
        if !probes.is_empty() {
            let window_start = lowered
                .char_indices()
                .rev()
                .take(SCOPE_WINDOW_CHARS)
                .last()
                .map(|(i, _)| i)
                .unwrap_or(0);
            let tail = &lowered[window_start..];
            if !probes.iter().any(|probe| tail.contains(probe.as_str())) {
                return false;
            }
        }
    }

    for event in &outline.future_events {
        let phrase = event.trim().to_lowercase();
        if !phrase.is_empty() && lowered.contains(&phrase) {
            return false;
        }
    }

    true
}

fn meaningful_words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|word| word.len() > 2 && !STOPWORDS.contains(&word.as_str()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn outline_with(hook: Option<&str>, future: &[&str]) -> SceneOutline {
        SceneOutline {
            scene_number: 1,
            title: "Arrival".into(),
            hook: hook.map(str::to_string),
            future_events: future.iter().map(|s| s.to_string()).collect(),
            word_count: 100,
            ..SceneOutline::default()
        }
    }

    fn prose(words: usize) -> String {
        (0..words)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn high_score_clean_critique_approves() {
        let mut critique = Critique {
            score: 9.0,
            ..Critique::default()
        };
        let content = prose(100);
        let verdict = finalize_critique(&mut critique, &content, 100, &outline_with(None, &[]));
        assert!(verdict.approved);
        assert_eq!(critique.revision_needed, Some(false));
        assert_eq!(critique.approved, Some(true));
    }

    #[test]
    fn word_count_failure_demands_revision_despite_approval() {
        let mut critique = Critique {
            score: 9.0,
            approved: Some(true),
            ..Critique::default()
        };
        // 40 words against a 100-word target: below the 0.7 floor.
        let content = prose(40);
        let verdict = finalize_critique(&mut critique, &content, 100, &outline_with(None, &[]));
        assert!(!verdict.approved);
        assert_eq!(critique.word_count_compliance, Some(false));
        assert_eq!(critique.revision_needed, Some(true));
    }

    #[test]
    fn issues_demand_revision_below_threshold() {
        let mut critique = Critique {
            score: 7.5,
            issues: vec!["flat dialogue".into()],
            ..Critique::default()
        };
        let content = prose(100);
        let verdict = finalize_critique(&mut critique, &content, 100, &outline_with(None, &[]));
        assert!(!verdict.approved);
    }

    #[test]
    fn low_score_demands_revision() {
        let mut critique = Critique {
            score: 6.0,
            revision_needed: Some(false),
            ..Critique::default()
        };
        let content = prose(100);
        let verdict = finalize_critique(&mut critique, &content, 100, &outline_with(None, &[]));
        assert!(!verdict.approved);
    }

    #[test]
    fn compliance_ratio_boundary() {
        assert!(word_count_compliant(70, 100));
        assert!(!word_count_compliant(69, 100));
        assert!(word_count_compliant(0, 0));
    }

    #[test]
    fn scope_fails_when_hook_is_never_landed() {
        let outline = outline_with(Some("the stranger's lantern"), &[]);
        let content = prose(200);
        assert!(!scope_adherence(&content, &outline));
    }

    #[test]
    fn scope_passes_when_hook_word_is_in_the_tail() {
        let outline = outline_with(Some("the stranger's lantern"), &[]);
        let content = format!("{} and then she saw the lantern glow", prose(50));
        assert!(scope_adherence(&content, &outline));
    }

    #[test]
    fn scope_fails_when_future_event_leaks() {
        let outline = outline_with(None, &["the shipwreck"]);
        let content = format!("{} rumors of the shipwreck spread", prose(20));
        assert!(!scope_adherence(&content, &outline));
    }

    #[test]
    fn empty_hook_passes_vacuously() {
        let outline = outline_with(None, &[]);
        assert!(scope_adherence("anything at all", &outline));
    }
}
