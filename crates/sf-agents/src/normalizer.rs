//! Output normalization.
//!
//! Model output is syntactically JSON-ish but semantically drifted: wrapped
//! in envelopes, fenced in markdown, with aliased field names, synonym
//! roles, and word counts as formatted strings. Everything here is purely
//! functional: `serde_json::Value` in, canonical typed shapes out. The
//! orchestrator never sees un-normalized values.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sf_core::types::{Character, Critique, Narrative, Outline, SceneOutline, WorldElement};

/// Default target when an outline scene has no usable word count.
pub const DEFAULT_SCENE_WORDS: usize = 1500;

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Pull a JSON document out of raw model text: direct parse first, then a
/// markdown-fenced json block, then the widest `{...}` / `[...]` span.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..end].trim()) {
                return Some(value);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Envelope unwrap
// ---------------------------------------------------------------------------

const ENVELOPE_KEYS: [&str; 10] = [
    "characters",
    "worldbuilding",
    "world",
    "outline",
    "narrative",
    "genesis",
    "critique",
    "feedback",
    "data",
    "result",
];

/// Unwrap `{"outline": {...}}`-style single-key envelopes.
pub fn unwrap_envelope(value: Value) -> Value {
    let envelope_key = match &value {
        Value::Object(map) if map.len() == 1 => map
            .keys()
            .next()
            .filter(|key| ENVELOPE_KEYS.contains(&key.as_str()))
            .cloned(),
        _ => None,
    };
    match (envelope_key, value) {
        (Some(key), Value::Object(mut map)) => map.remove(&key).expect("single key present"),
        (_, value) => value,
    }
}

// ---------------------------------------------------------------------------
// Field canonicalization
// ---------------------------------------------------------------------------

/// `(aliases, canonical)`, applied left-to-right, first non-empty wins; an
/// existing non-empty canonical field is never overwritten.
struct FieldAlias {
    aliases: &'static [&'static str],
    canonical: &'static str,
}

const CHARACTER_ALIASES: &[FieldAlias] = &[
    FieldAlias {
        aliases: &["Name", "fullName", "characterName", "character_name"],
        canonical: "name",
    },
    FieldAlias {
        aliases: &["Role", "character_role"],
        canonical: "role",
    },
    FieldAlias {
        aliases: &["Psychology", "personality"],
        canonical: "psychology",
    },
    FieldAlias {
        aliases: &["Description", "summary"],
        canonical: "description",
    },
    FieldAlias {
        aliases: &["Background", "backstory", "history"],
        canonical: "background",
    },
    FieldAlias {
        aliases: &["Arc", "characterArc", "character_arc"],
        canonical: "arc",
    },
];

const SCENE_ALIASES: &[FieldAlias] = &[
    FieldAlias {
        aliases: &["sceneNumber", "scene_number", "number"],
        canonical: "scene_number",
    },
    FieldAlias {
        aliases: &["wordCount", "word_count", "words", "targetWords", "target_words"],
        canonical: "word_count",
    },
    FieldAlias {
        aliases: &["futureEvents", "future_events"],
        canonical: "future_events",
    },
    FieldAlias {
        aliases: &["Title", "name"],
        canonical: "title",
    },
    FieldAlias {
        aliases: &["Setting", "location"],
        canonical: "setting",
    },
];

const CRITIQUE_ALIASES: &[FieldAlias] = &[
    FieldAlias {
        aliases: &["revisionNeeded", "revision_needed", "needsRevision", "needs_revision"],
        canonical: "revision_needed",
    },
    FieldAlias {
        aliases: &["revisionRequests", "revision_requests", "requestedChanges"],
        canonical: "revision_requests",
    },
    FieldAlias {
        aliases: &["wordCountCompliance", "word_count_compliance"],
        canonical: "word_count_compliance",
    },
    FieldAlias {
        aliases: &["scopeAdherence", "scope_adherence"],
        canonical: "scope_adherence",
    },
    FieldAlias {
        aliases: &["Score", "rating"],
        canonical: "score",
    },
];

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn canonicalize(map: &mut Map<String, Value>, aliases: &[FieldAlias]) {
    for rule in aliases {
        let has_canonical = map
            .get(rule.canonical)
            .map(|v| !is_empty_value(v))
            .unwrap_or(false);
        if has_canonical {
            continue;
        }
        for alias in rule.aliases {
            if *alias == rule.canonical {
                continue;
            }
            let candidate = map.get(*alias).filter(|v| !is_empty_value(v)).cloned();
            if let Some(value) = candidate {
                map.insert(rule.canonical.to_string(), value);
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Role normalization
// ---------------------------------------------------------------------------

/// Map role synonyms to canonical names; unknown roles are lowercased and
/// preserved.
pub fn normalize_role(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    match lowered.as_str() {
        "hero" | "main" | "main character" | "protagonist" | "lead" => "protagonist".to_string(),
        "villain" | "antagonist" => "antagonist".to_string(),
        "side" | "secondary" | "minor" | "supporting" | "side character" => "supporting".to_string(),
        _ => lowered,
    }
}

// ---------------------------------------------------------------------------
// Word counts and scores
// ---------------------------------------------------------------------------

/// Parse a word count that may arrive as a number or a formatted string
/// (`"1,900"`, `"approx. 1500 words"`); non-positive or unparseable values
/// fall back to `default`.
pub fn parse_word_count(value: Option<&Value>, default: usize) -> usize {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
        Some(Value::String(s)) => {
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            digits.parse::<usize>().ok()
        }
        _ => None,
    };
    match parsed {
        Some(n) if n > 0 => n,
        _ => default,
    }
}

fn parse_score(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    raw.unwrap_or(5.0).clamp(1.0, 10.0)
}

// ---------------------------------------------------------------------------
// Narrative
// ---------------------------------------------------------------------------

pub fn normalize_narrative(value: Value) -> Narrative {
    let value = unwrap_envelope(value);
    let Value::Object(mut map) = value else {
        return Narrative::default();
    };
    canonicalize(
        &mut map,
        &[
            FieldAlias {
                aliases: &["Premise", "concept", "logline"],
                canonical: "premise",
            },
            FieldAlias {
                aliases: &["Genre"],
                canonical: "genre",
            },
            FieldAlias {
                aliases: &["Tone", "mood"],
                canonical: "tone",
            },
            FieldAlias {
                aliases: &["narrativeArc", "narrative_arc", "Arc"],
                canonical: "arc",
            },
            FieldAlias {
                aliases: &["Hook", "opening_hook", "openingHook"],
                canonical: "hook",
            },
        ],
    );
    // Themes may arrive as a single string.
    if let Some(Value::String(theme)) = map.get("themes").cloned() {
        map.insert("themes".into(), Value::Array(vec![Value::String(theme)]));
    }
    serde_json::from_value(Value::Object(map)).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Characters
// ---------------------------------------------------------------------------

/// Normalize the Profiler output. Entries without a name are dropped.
pub fn normalize_characters(value: Value) -> Vec<Character> {
    let value = unwrap_envelope(value);
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("characters") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("characters".into(), other);
                vec![Value::Object(map)]
            }
            // A single character object.
            None => vec![Value::Object(map)],
        },
        _ => return Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| {
            let Value::Object(mut map) = item else {
                return None;
            };
            canonicalize(&mut map, CHARACTER_ALIASES);
            let name = map.get("name").and_then(Value::as_str)?.trim().to_string();
            if name.is_empty() {
                return None;
            }
            let role = map
                .get("role")
                .and_then(Value::as_str)
                .map(normalize_role)
                .unwrap_or_else(|| "supporting".to_string());
            map.insert("role".into(), Value::String(role));
            serde_json::from_value::<Character>(Value::Object(map)).ok()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Worldbuilding
// ---------------------------------------------------------------------------

pub fn normalize_worldbuilding(value: Value) -> BTreeMap<String, WorldElement> {
    let value = unwrap_envelope(value);
    let mut out = BTreeMap::new();
    match value {
        Value::Object(map) => {
            for (key, element) in map {
                if let Ok(element) = serde_json::from_value::<WorldElement>(element) {
                    out.insert(key, element);
                }
            }
        }
        Value::Array(items) => {
            for (index, item) in items.into_iter().enumerate() {
                let key = item
                    .get("type")
                    .or_else(|| item.get("element_type"))
                    .or_else(|| item.get("name"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_lowercase().replace(' ', "_"))
                    .unwrap_or_else(|| format!("element_{}", index + 1));
                if let Ok(element) = serde_json::from_value::<WorldElement>(item) {
                    out.insert(key, element);
                }
            }
        }
        _ => {}
    }
    out
}

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

/// Normalize the Strategist outline. A bare array is wrapped as
/// `{scenes: [...]}`; each scene gets a 1-based `scene_number` fallback, a
/// title fallback of `"Scene N"`, and a parsed word count.
pub fn normalize_outline(value: Value) -> Outline {
    let value = unwrap_envelope(value);
    let scenes = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("scenes") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    let scenes = scenes
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let Value::Object(mut map) = item else {
                return None;
            };
            canonicalize(&mut map, SCENE_ALIASES);

            let scene_number = map
                .get("scene_number")
                .and_then(Value::as_u64)
                .map(|n| n as u32)
                .unwrap_or(index as u32 + 1);
            map.insert("scene_number".into(), Value::from(scene_number));

            let title = map
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Scene {scene_number}"));
            map.insert("title".into(), Value::String(title));

            let word_count = parse_word_count(map.get("word_count"), DEFAULT_SCENE_WORDS);
            map.insert("word_count".into(), Value::from(word_count));

            serde_json::from_value::<SceneOutline>(Value::Object(map)).ok()
        })
        .collect();

    Outline { scenes }
}

// ---------------------------------------------------------------------------
// Critique
// ---------------------------------------------------------------------------

/// Normalize a Critic verdict: canonicalize aliases, clamp the score to
/// `[1, 10]`, and write *both* `revision_needed` and `revisionNeeded` into
/// the JSON form (older consumers read the camelCase spelling).
pub fn normalize_critique(value: Value) -> (Critique, Value) {
    let value = unwrap_envelope(value);
    let mut map = match value {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    canonicalize(&mut map, CRITIQUE_ALIASES);

    let score = parse_score(map.get("score"));
    map.insert("score".into(), Value::from(score));

    for list_key in ["issues", "revision_requests", "strengths"] {
        match map.get(list_key).cloned() {
            Some(Value::Array(_)) => {}
            Some(Value::String(s)) if !s.trim().is_empty() => {
                map.insert(list_key.into(), Value::Array(vec![Value::String(s)]));
            }
            _ => {
                map.insert(list_key.into(), Value::Array(Vec::new()));
            }
        }
    }

    if let Some(revision) = map.get("revision_needed").cloned() {
        map.insert("revisionNeeded".into(), revision);
    }

    let normalized = Value::Object(map);
    let critique = serde_json::from_value::<Critique>(normalized.clone()).unwrap_or_else(|_| Critique {
        score,
        ..Critique::default()
    });
    (critique, normalized)
}

/// Re-apply the dual-spelling rule after server-side fields are filled in.
pub fn critique_wire_form(critique: &Critique) -> Value {
    let mut value = serde_json::to_value(critique).unwrap_or_else(|_| Value::Object(Map::new()));
    if let Value::Object(ref mut map) = value {
        if let Some(revision) = map.get("revision_needed").cloned() {
            map.insert("revisionNeeded".into(), revision);
        }
    }
    value
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
