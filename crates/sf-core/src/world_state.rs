use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Character;

// ---------------------------------------------------------------------------
// WorldState
// ---------------------------------------------------------------------------

/// The canonical world-state document. Updated only by [`apply`] with diffs
/// emitted by the Archivist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    #[serde(default)]
    pub characters: BTreeMap<String, CharacterState>,
    #[serde(default)]
    pub locations: BTreeMap<String, LocationState>,
    #[serde(default)]
    pub flags: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    pub location: String,
    pub status: String,
    #[serde(default)]
    pub possessions: Vec<String>,
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
}

impl Default for CharacterState {
    fn default() -> Self {
        Self {
            location: "unknown".to_string(),
            status: "alive".to_string(),
            possessions: Vec::new(),
            relationships: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationState {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten, default)]
    pub details: BTreeMap<String, Value>,
}

/// Build the initial world state from the character roster: every character
/// starts at `location = "unknown"`, `status = "alive"`, with empty
/// possessions and relationships.
pub fn initial_from_characters(characters: &[Character]) -> WorldState {
    let mut state = WorldState::default();
    for character in characters {
        state
            .characters
            .insert(character.name.clone(), CharacterState::default());
    }
    state
}

// ---------------------------------------------------------------------------
// Diff application
// ---------------------------------------------------------------------------

/// Apply a structured diff to `current`, returning a new world state. The
/// inputs are never mutated.
///
/// Diff shape (all sections and sub-keys optional):
/// ```json
/// {
///   "characters": {"add": {"Name": {..}}, "remove": ["Name"], "set": {"Name": {"location": "harbor"}}},
///   "locations":  {"add": {..}, "remove": [..], "set": {..}},
///   "flags":      {"add": {"storm_passed": true}, "remove": [..], "set": {..}}
/// }
/// ```
///
/// Unknown top-level keys are a warned no-op. Within one call all additions
/// are applied first, then all removals, then all field sets, so any
/// ordering of producers yields the same result.
pub fn apply(current: &WorldState, diff: &Value, scene_number: u32) -> WorldState {
    let mut next = current.clone();

    let Some(sections) = diff.as_object() else {
        tracing::warn!(scene = scene_number, "world-state diff is not an object, ignoring");
        return next;
    };

    for key in sections.keys() {
        if !matches!(key.as_str(), "characters" | "locations" | "flags") {
            tracing::warn!(scene = scene_number, section = %key, "unknown world-state diff section, ignoring");
        }
    }

    // Phase 1: additions.
    if let Some(adds) = section_map(sections.get("characters"), "add") {
        for (name, value) in adds {
            let state = serde_json::from_value(value.clone()).unwrap_or_default();
            next.characters.insert(name.clone(), state);
        }
    }
    if let Some(adds) = section_map(sections.get("locations"), "add") {
        for (name, value) in adds {
            let state = serde_json::from_value(value.clone()).unwrap_or_default();
            next.locations.insert(name.clone(), state);
        }
    }
    if let Some(adds) = section_map(sections.get("flags"), "add") {
        for (name, value) in adds {
            next.flags.insert(name.clone(), value.clone());
        }
    }

    // Phase 2: removals.
    for name in section_list(sections.get("characters"), "remove") {
        next.characters.remove(&name);
    }
    for name in section_list(sections.get("locations"), "remove") {
        next.locations.remove(&name);
    }
    for name in section_list(sections.get("flags"), "remove") {
        next.flags.remove(&name);
    }

    // Phase 3: field sets.
    if let Some(sets) = section_map(sections.get("characters"), "set") {
        for (name, fields) in sets {
            let entry = next.characters.entry(name.clone()).or_default();
            set_character_fields(entry, fields);
        }
    }
    if let Some(sets) = section_map(sections.get("locations"), "set") {
        for (name, fields) in sets {
            let entry = next.locations.entry(name.clone()).or_default();
            set_location_fields(entry, fields);
        }
    }
    if let Some(sets) = section_map(sections.get("flags"), "set") {
        for (name, value) in sets {
            next.flags.insert(name.clone(), value.clone());
        }
    }

    next
}

fn section_map<'a>(
    section: Option<&'a Value>,
    op: &str,
) -> Option<&'a serde_json::Map<String, Value>> {
    section?.get(op)?.as_object()
}

fn section_list(section: Option<&Value>, op: &str) -> Vec<String> {
    section
        .and_then(|s| s.get(op))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn set_character_fields(state: &mut CharacterState, fields: &Value) {
    let Some(fields) = fields.as_object() else {
        return;
    };
    for (field, value) in fields {
        match field.as_str() {
            "location" => {
                if let Some(s) = value.as_str() {
                    state.location = s.to_string();
                }
            }
            "status" => {
                if let Some(s) = value.as_str() {
                    state.status = s.to_string();
                }
            }
            "possessions" => {
                if let Some(items) = value.as_array() {
                    state.possessions = items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                }
            }
            "relationships" => {
                if let Some(map) = value.as_object() {
                    for (other, rel) in map {
                        if let Some(rel) = rel.as_str() {
                            state.relationships.insert(other.clone(), rel.to_string());
                        }
                    }
                }
            }
            other => {
                tracing::debug!(field = %other, "unknown character field in diff set, ignoring");
            }
        }
    }
}

fn set_location_fields(state: &mut LocationState, fields: &Value) {
    let Some(fields) = fields.as_object() else {
        return;
    };
    for (field, value) in fields {
        if field == "description" {
            if let Some(s) = value.as_str() {
                state.description = Some(s.to_string());
            }
        } else {
            state.details.insert(field.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roster() -> WorldState {
        initial_from_characters(&[
            Character {
                name: "Elena".into(),
                role: "protagonist".into(),
                ..Character::default()
            },
            Character {
                name: "Marcus".into(),
                role: "antagonist".into(),
                ..Character::default()
            },
        ])
    }

    #[test]
    fn initial_state_defaults_every_character() {
        let state = roster();
        let elena = &state.characters["Elena"];
        assert_eq!(elena.location, "unknown");
        assert_eq!(elena.status, "alive");
        assert!(elena.possessions.is_empty());
    }

    #[test]
    fn apply_does_not_mutate_input() {
        let before = roster();
        let diff = json!({"characters": {"set": {"Elena": {"location": "harbor"}}}});
        let after = apply(&before, &diff, 1);
        assert_eq!(before.characters["Elena"].location, "unknown");
        assert_eq!(after.characters["Elena"].location, "harbor");
    }

    #[test]
    fn additions_then_removals_then_sets() {
        let before = roster();
        // The set targets a character added in the same diff; the remove
        // targets a pre-existing one. Ordering makes this deterministic.
        let diff = json!({
            "characters": {
                "add": {"Iris": {"location": "pier", "status": "alive"}},
                "remove": ["Marcus"],
                "set": {"Iris": {"status": "injured"}}
            }
        });
        let after = apply(&before, &diff, 2);
        assert!(!after.characters.contains_key("Marcus"));
        assert_eq!(after.characters["Iris"].location, "pier");
        assert_eq!(after.characters["Iris"].status, "injured");
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let before = roster();
        let diff = json!({"weather": {"add": {"storm": true}}});
        let after = apply(&before, &diff, 1);
        assert_eq!(before, after);
    }

    #[test]
    fn flags_and_locations_round_through() {
        let before = WorldState::default();
        let diff = json!({
            "locations": {"add": {"Lighthouse": {"description": "white tower"}}},
            "flags": {"add": {"storm_passed": true}}
        });
        let after = apply(&before, &diff, 1);
        assert_eq!(
            after.locations["Lighthouse"].description.as_deref(),
            Some("white tower")
        );
        assert_eq!(after.flags["storm_passed"], json!(true));
    }

    #[test]
    fn relationship_sets_merge_into_existing_map() {
        let mut before = roster();
        before
            .characters
            .get_mut("Elena")
            .unwrap()
            .relationships
            .insert("Marcus".into(), "rival".into());
        let diff = json!({
            "characters": {"set": {"Elena": {"relationships": {"Iris": "ally"}}}}
        });
        let after = apply(&before, &diff, 3);
        let rels = &after.characters["Elena"].relationships;
        assert_eq!(rels["Marcus"], "rival");
        assert_eq!(rels["Iris"], "ally");
    }
}
