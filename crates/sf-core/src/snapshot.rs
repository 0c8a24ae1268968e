//! Snapshot projection for restart survival.
//!
//! A [`RunSnapshot`] is the JSON-compatible form of a [`GenerationRun`]:
//! integer-keyed maps (drafts, critiques, revision counts) become arrays of
//! `{scene_number, ...}` records for transport, and convert back on restore.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constraint::{ConstraintStore, KeyConstraint};
use crate::phase::Phase;
use crate::types::{
    Character, Critique, Draft, GenerationMode, GenerationRun, LlmSettings, Narrative, Outline,
    RawFact, SceneOutline, WorldElement,
};
use crate::world_state::WorldState;

/// Artifact type under which snapshots are persisted.
pub const SNAPSHOT_ARTIFACT: &str = "run_state_snapshot";

// ---------------------------------------------------------------------------
// Keyed records (map -> array projection)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub scene_number: u32,
    #[serde(flatten)]
    pub draft: Draft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueRecord {
    pub scene_number: u32,
    pub critiques: Vec<Critique>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub scene_number: u32,
    pub count: u32,
}

// ---------------------------------------------------------------------------
// RunSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub project_id: String,
    pub seed_idea: String,
    pub llm: LlmSettings,
    pub mode: GenerationMode,
    pub phase: Phase,
    pub current_scene: u32,
    pub total_scenes: u32,
    pub is_paused: bool,
    pub is_completed: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub narrative: Option<Narrative>,
    pub characters: Vec<Character>,
    pub worldbuilding: BTreeMap<String, WorldElement>,
    pub outline: Option<Outline>,
    pub drafts: Vec<DraftRecord>,
    pub critiques: Vec<CritiqueRecord>,
    pub revision_count: Vec<RevisionRecord>,
    pub raw_facts: Vec<RawFact>,
    pub constraints: Vec<KeyConstraint>,
    pub world_state: WorldState,
    pub last_archivist_scene: u32,
    pub current_scene_outline: Option<SceneOutline>,
}

impl RunSnapshot {
    pub fn from_run(run: &GenerationRun) -> Self {
        Self {
            run_id: run.run_id,
            project_id: run.project_id.clone(),
            seed_idea: run.seed_idea.clone(),
            llm: run.llm.clone(),
            mode: run.mode,
            phase: run.phase,
            current_scene: run.current_scene,
            total_scenes: run.total_scenes,
            is_paused: run.is_paused,
            is_completed: run.is_completed,
            error: run.error.clone(),
            started_at: run.started_at,
            updated_at: run.updated_at,
            narrative: run.narrative.clone(),
            characters: run.characters.clone(),
            worldbuilding: run.worldbuilding.clone(),
            outline: run.outline.clone(),
            drafts: run
                .drafts
                .iter()
                .map(|(scene, draft)| DraftRecord {
                    scene_number: *scene,
                    draft: draft.clone(),
                })
                .collect(),
            critiques: run
                .critiques
                .iter()
                .map(|(scene, critiques)| CritiqueRecord {
                    scene_number: *scene,
                    critiques: critiques.clone(),
                })
                .collect(),
            revision_count: run
                .revision_count
                .iter()
                .map(|(scene, count)| RevisionRecord {
                    scene_number: *scene,
                    count: *count,
                })
                .collect(),
            raw_facts: run.raw_facts.clone(),
            constraints: run.constraints.snapshot(),
            world_state: run.world_state.clone(),
            last_archivist_scene: run.last_archivist_scene,
            current_scene_outline: run.current_scene_outline.clone(),
        }
    }

    pub fn into_run(self) -> GenerationRun {
        GenerationRun {
            run_id: self.run_id,
            project_id: self.project_id,
            seed_idea: self.seed_idea,
            llm: self.llm,
            mode: self.mode,
            phase: self.phase,
            current_scene: self.current_scene,
            total_scenes: self.total_scenes,
            is_paused: self.is_paused,
            is_completed: self.is_completed,
            error: self.error,
            started_at: self.started_at,
            updated_at: self.updated_at,
            narrative: self.narrative,
            characters: self.characters,
            worldbuilding: self.worldbuilding,
            outline: self.outline,
            drafts: self
                .drafts
                .into_iter()
                .map(|record| (record.scene_number, record.draft))
                .collect(),
            critiques: self
                .critiques
                .into_iter()
                .map(|record| (record.scene_number, record.critiques))
                .collect(),
            revision_count: self
                .revision_count
                .into_iter()
                .map(|record| (record.scene_number, record.count))
                .collect(),
            raw_facts: self.raw_facts,
            constraints: ConstraintStore::from_entries(self.constraints),
            world_state: self.world_state,
            last_archivist_scene: self.last_archivist_scene,
            current_scene_outline: self.current_scene_outline,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
