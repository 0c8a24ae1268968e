use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Narrative;

/// Keys installed as immutable seed constraints after Genesis.
pub const SEED_KEYS: [&str; 5] = ["seed_idea", "premise", "genre", "tone", "narrative_arc"];

// ---------------------------------------------------------------------------
// KeyConstraint
// ---------------------------------------------------------------------------

/// A small `(key, value)` fact about the story that later generation must
/// respect. Seed constraints are immutable; everything else follows
/// last-writer-wins on timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyConstraint {
    pub key: String,
    pub value: String,
    /// 0 means the constraint predates any scene (seed).
    pub scene_number: u32,
    pub timestamp: DateTime<Utc>,
    pub immutable: bool,
}

impl KeyConstraint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, scene_number: u32) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            scene_number,
            timestamp: Utc::now(),
            immutable: false,
        }
    }

    /// An immutable seed constraint (scene 0).
    pub fn seed(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            scene_number: 0,
            timestamp: Utc::now(),
            immutable: true,
        }
    }
}

/// Build the seed constraint set from the genesis narrative. Empty fields
/// are skipped so the store only ever carries seeds that exist.
pub fn seed_constraints(seed_idea: &str, narrative: &Narrative) -> Vec<KeyConstraint> {
    let pairs = [
        ("seed_idea", seed_idea),
        ("premise", narrative.premise.as_str()),
        ("genre", narrative.genre.as_str()),
        ("tone", narrative.tone.as_str()),
        ("narrative_arc", narrative.arc.as_str()),
    ];
    pairs
        .into_iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(key, value)| KeyConstraint::seed(key, value))
        .collect()
}

// ---------------------------------------------------------------------------
// ConstraintStore
// ---------------------------------------------------------------------------

/// In-memory append-only list of keyed constraints.
///
/// Invariants:
/// - immutable entries, once added, are never overwritten;
/// - among mutable entries there is at most one per key (merge replaces in
///   place, preserving insertion order).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintStore {
    entries: Vec<KeyConstraint>,
}

impl ConstraintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a snapshot's entry list.
    pub fn from_entries(entries: Vec<KeyConstraint>) -> Self {
        Self { entries }
    }

    /// Install the seed constraints. Idempotent: if any seed constraint is
    /// already present the call is ignored.
    pub fn add_seed(&mut self, seeds: Vec<KeyConstraint>) -> bool {
        if self.entries.iter().any(|c| c.immutable) {
            tracing::debug!("seed constraints already installed, ignoring");
            return false;
        }
        self.entries.extend(seeds);
        true
    }

    /// Merge proposed constraints. For each proposal:
    /// - an immutable entry with the same key wins and the proposal is
    ///   dropped;
    /// - a mutable entry with the same key is replaced iff the proposal's
    ///   timestamp is strictly newer;
    /// - otherwise the proposal is appended.
    pub fn merge(&mut self, proposed: Vec<KeyConstraint>) {
        for candidate in proposed {
            match self.entries.iter_mut().find(|c| c.key == candidate.key) {
                Some(existing) if existing.immutable => {
                    tracing::debug!(key = %candidate.key, "dropping proposal against immutable constraint");
                }
                Some(existing) => {
                    if candidate.timestamp > existing.timestamp {
                        *existing = candidate;
                    }
                }
                None => self.entries.push(candidate),
            }
        }
    }

    /// All entries in insertion order.
    pub fn snapshot(&self) -> Vec<KeyConstraint> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&KeyConstraint> {
        self.entries.iter().find(|c| c.key == key)
    }

    /// Deterministic serialization for prompt injection.
    pub fn render_block(constraints: &[KeyConstraint]) -> String {
        let mut out = String::new();
        for c in constraints {
            out.push_str("- ");
            out.push_str(&c.key);
            out.push_str(": ");
            out.push_str(&c.value);
            if c.immutable {
                out.push_str(" [IMMUTABLE]");
            }
            out.push('\n');
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(key: &str, value: &str, offset_secs: i64) -> KeyConstraint {
        let mut c = KeyConstraint::new(key, value, 1);
        c.timestamp = Utc::now() + Duration::seconds(offset_secs);
        c
    }

    #[test]
    fn add_seed_is_idempotent() {
        let mut store = ConstraintStore::new();
        assert!(store.add_seed(vec![KeyConstraint::seed("genre", "noir")]));
        assert!(!store.add_seed(vec![KeyConstraint::seed("genre", "romance")]));
        assert_eq!(store.get("genre").unwrap().value, "noir");
    }

    #[test]
    fn merge_never_overwrites_immutable() {
        let mut store = ConstraintStore::new();
        store.add_seed(vec![KeyConstraint::seed("tone", "melancholy")]);
        store.merge(vec![at("tone", "cheerful", 60)]);
        let entry = store.get("tone").unwrap();
        assert_eq!(entry.value, "melancholy");
        assert!(entry.immutable);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn merge_is_last_writer_wins_in_either_order() {
        let older = at("elena_location", "lighthouse", 0);
        let newer = at("elena_location", "harbor", 30);

        let mut forward = ConstraintStore::new();
        forward.merge(vec![older.clone()]);
        forward.merge(vec![newer.clone()]);

        let mut backward = ConstraintStore::new();
        backward.merge(vec![newer.clone()]);
        backward.merge(vec![older.clone()]);

        assert_eq!(forward.get("elena_location").unwrap().value, "harbor");
        assert_eq!(backward.get("elena_location").unwrap().value, "harbor");
        assert_eq!(forward.len(), 1);
        assert_eq!(backward.len(), 1);
    }

    #[test]
    fn merge_appends_new_keys_in_insertion_order() {
        let mut store = ConstraintStore::new();
        store.merge(vec![at("a", "1", 0), at("b", "2", 0)]);
        store.merge(vec![at("c", "3", 0)]);
        let keys: Vec<_> = store.snapshot().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn render_block_marks_immutable_entries() {
        let mut store = ConstraintStore::new();
        store.add_seed(vec![KeyConstraint::seed("genre", "noir")]);
        store.merge(vec![at("elena_status", "missing", 0)]);
        let block = ConstraintStore::render_block(&store.snapshot());
        assert_eq!(block, "- genre: noir [IMMUTABLE]\n- elena_status: missing\n");
    }

    #[test]
    fn seed_constraints_skip_empty_fields() {
        let narrative = Narrative {
            premise: "a keeper meets a stranger".into(),
            genre: "mystery".into(),
            tone: String::new(),
            arc: "redemption".into(),
            ..Narrative::default()
        };
        let seeds = seed_constraints("lighthouse", &narrative);
        let keys: Vec<_> = seeds.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["seed_idea", "premise", "genre", "narrative_arc"]);
        assert!(seeds.iter().all(|c| c.immutable && c.scene_number == 0));
    }
}
