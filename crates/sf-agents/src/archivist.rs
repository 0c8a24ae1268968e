//! The Archivist continuity pass.
//!
//! Every few scenes (and once more at end of drafting) the Archivist
//! consumes the raw facts recorded since its previous pass, consolidates
//! them into key-constraint proposals and a world-state diff, and the
//! run's constraint store and world state are updated from the result.
//! A malformed Archivist response is a safe fallback: the pass is skipped
//! and a `validation_error` event records the reason.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};
use sf_core::constraint::{ConstraintStore, KeyConstraint};
use sf_core::types::GenerationRun;
use sf_core::world_state;
use sf_harness::prompts::fallback;
use sf_stream::{EventLog, EventType};
use tracing::{info, warn};

use crate::normalizer;
use crate::roles::AgentRole;
use crate::runner::{AgentError, AgentRunner, RunOptions};

// ---------------------------------------------------------------------------
// Output shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct ProposedConstraint {
    key: String,
    value: String,
}

/// One notable development, as reported to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct Development {
    pub subject: String,
    pub change: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivistOutcome {
    pub constraint_count: usize,
    pub developments: Vec<Development>,
}

// ---------------------------------------------------------------------------
// Pass
// ---------------------------------------------------------------------------

/// Run one Archivist pass over the raw facts in scenes
/// `(run.last_archivist_scene, up_to_scene]`.
pub async fn run_pass(
    runner: &AgentRunner,
    events: &EventLog,
    run: &mut GenerationRun,
    up_to_scene: u32,
) -> Result<ArchivistOutcome, AgentError> {
    let run_id = run.run_id;
    events.publish(run_id, EventType::ArchivistStart, json!({"upToScene": up_to_scene}));

    let fresh_facts: Vec<String> = run
        .raw_facts
        .iter()
        .filter(|fact| fact.scene_number > run.last_archivist_scene && fact.scene_number <= up_to_scene)
        .map(|fact| format!("[scene {}] {}", fact.scene_number, fact.fact))
        .collect();

    if fresh_facts.is_empty() {
        run.last_archivist_scene = up_to_scene;
        let count = run.constraints.len();
        events.publish(
            run_id,
            EventType::ArchivistComplete,
            json!({"upToScene": up_to_scene, "constraintCount": count}),
        );
        return Ok(ArchivistOutcome {
            constraint_count: count,
            developments: Vec::new(),
        });
    }
    let total_facts = fresh_facts.len();

    let vars = HashMap::from([
        ("facts".to_string(), fresh_facts.join("\n")),
        (
            "constraints".to_string(),
            ConstraintStore::render_block(&run.constraints.snapshot()),
        ),
        (
            "world_state".to_string(),
            serde_json::to_string(&run.world_state).unwrap_or_default(),
        ),
    ]);

    let output = runner
        .run(
            AgentRole::Archivist,
            "archivist",
            fallback::ARCHIVIST,
            &vars,
            &RunOptions::default(),
        )
        .await?;

    let outcome = match parse_archivist_output(&output.content) {
        Some(parsed) => parsed,
        None => {
            // Safe fallback: record the validation failure and move on.
            warn!(run_id = %run_id, up_to_scene, "archivist output unusable, skipping pass");
            events.publish(
                run_id,
                EventType::ValidationError,
                json!({
                    "agent": AgentRole::Archivist.agent_id(),
                    "field": "archivist_output",
                    "reason": "response was not the expected JSON shape",
                }),
            );
            run.last_archivist_scene = up_to_scene;
            let count = run.constraints.len();
            events.publish(
                run_id,
                EventType::ArchivistComplete,
                json!({"upToScene": up_to_scene, "constraintCount": count}),
            );
            return Ok(ArchivistOutcome {
                constraint_count: count,
                developments: Vec::new(),
            });
        }
    };
    let (proposals, diff, developments) = outcome;

    let proposed: Vec<KeyConstraint> = proposals
        .into_iter()
        .map(|p| KeyConstraint::new(p.key, p.value, up_to_scene))
        .collect();
    run.constraints.merge(proposed);

    if let Some(diff) = diff {
        run.world_state = world_state::apply(&run.world_state, &diff, up_to_scene);
    }
    run.last_archivist_scene = up_to_scene;
    run.touch();

    let constraint_count = run.constraints.len();
    info!(run_id = %run_id, up_to_scene, constraint_count, "archivist pass complete");

    events.publish(
        run_id,
        EventType::NewDevelopmentsCollected,
        json!({
            "sceneNum": up_to_scene,
            "developments": &developments,
            "totalFacts": total_facts,
        }),
    );
    events.publish(
        run_id,
        EventType::ArchivistComplete,
        json!({"upToScene": up_to_scene, "constraintCount": constraint_count}),
    );

    Ok(ArchivistOutcome {
        constraint_count,
        developments,
    })
}

type ParsedArchivist = (Vec<ProposedConstraint>, Option<Value>, Vec<Development>);

fn parse_archivist_output(content: &str) -> Option<ParsedArchivist> {
    let value = normalizer::extract_json(content)?;
    let map = value.as_object()?;

    let proposals = map
        .get("constraints")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let diff = map
        .get("world_state_diff")
        .or_else(|| map.get("worldStateDiff"))
        .cloned()
        .filter(|d| d.is_object());

    let developments = map
        .get("developments")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    Some((proposals, diff, developments))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sf_core::types::{GenerationMode, LlmSettings, RawFact};
    use sf_harness::prompts::BuiltinPromptStore;
    use sf_harness::provider::MockProvider;

    fn runner_with(mock: &MockProvider) -> AgentRunner {
        AgentRunner::new(
            Arc::new(mock.clone()),
            Arc::new(BuiltinPromptStore::default()),
            "mock-model",
        )
    }

    fn run_with_facts() -> GenerationRun {
        let mut run = GenerationRun::new("p", "seed", LlmSettings::default(), GenerationMode::Full);
        run.constraints
            .add_seed(vec![KeyConstraint::seed("genre", "mystery")]);
        run.raw_facts
            .push(RawFact::new("Elena moved to the harbor.", "writer", 1));
        run.raw_facts
            .push(RawFact::new("Marcus watched from the pier.", "writer", 2));
        run
    }

    #[tokio::test]
    async fn pass_merges_constraints_and_applies_diff() {
        let mock = MockProvider::new();
        mock.push_content(
            r#"{
                "constraints": [{"key": "elena_location", "value": "harbor"}],
                "world_state_diff": {"characters": {"set": {"Elena": {"location": "harbor"}}}},
                "developments": [{"subject": "Elena", "change": "moved to the harbor", "category": "movement"}]
            }"#,
        );
        let runner = runner_with(&mock);
        let events = EventLog::new();
        let mut run = run_with_facts();
        run.world_state
            .characters
            .insert("Elena".into(), Default::default());

        let outcome = run_pass(&runner, &events, &mut run, 3).await.unwrap();
        assert_eq!(outcome.constraint_count, 2);
        assert_eq!(outcome.developments.len(), 1);
        assert_eq!(run.constraints.get("elena_location").unwrap().value, "harbor");
        assert_eq!(run.world_state.characters["Elena"].location, "harbor");
        assert_eq!(run.last_archivist_scene, 3);

        let types: Vec<_> = events
            .range(run.run_id, 0, 100)
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                EventType::ArchivistStart,
                EventType::NewDevelopmentsCollected,
                EventType::ArchivistComplete
            ]
        );
    }

    #[tokio::test]
    async fn seed_constraints_survive_any_pass() {
        let mock = MockProvider::new();
        mock.push_content(r#"{"constraints": [{"key": "genre", "value": "romance"}]}"#);
        let runner = runner_with(&mock);
        let events = EventLog::new();
        let mut run = run_with_facts();

        run_pass(&runner, &events, &mut run, 2).await.unwrap();
        let genre = run.constraints.get("genre").unwrap();
        assert_eq!(genre.value, "mystery");
        assert!(genre.immutable);
    }

    #[tokio::test]
    async fn malformed_output_is_a_safe_fallback() {
        let mock = MockProvider::new();
        mock.push_content("I could not produce JSON, sorry.");
        let runner = runner_with(&mock);
        let events = EventLog::new();
        let mut run = run_with_facts();

        let outcome = run_pass(&runner, &events, &mut run, 2).await.unwrap();
        assert_eq!(outcome.constraint_count, 1);
        assert_eq!(run.last_archivist_scene, 2);

        let types: Vec<_> = events
            .range(run.run_id, 0, 100)
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&EventType::ValidationError));
        assert!(types.contains(&EventType::ArchivistComplete));
    }

    #[tokio::test]
    async fn pass_without_fresh_facts_skips_the_agent() {
        let mock = MockProvider::new();
        let runner = runner_with(&mock);
        let events = EventLog::new();
        let mut run = run_with_facts();
        run.last_archivist_scene = 2;

        let outcome = run_pass(&runner, &events, &mut run, 2).await.unwrap();
        assert_eq!(outcome.constraint_count, 1);
        assert!(mock.captured_requests().is_empty());
    }
}
