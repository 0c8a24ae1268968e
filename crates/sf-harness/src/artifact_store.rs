//! Artifact persistence abstraction.
//!
//! Artifacts are keyed by `(run_id, artifact_type)`; the normalized tables
//! for characters, drafts, and critiques hang off the same trait as typed
//! upserts. Field naming is snake_case at this boundary regardless of the
//! in-memory representation, via the recursive key transform in
//! `sf_core::casing`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sf_core::casing::to_snake_keys;
use sf_core::types::{Character, Critique, Draft};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Artifact kinds
// ---------------------------------------------------------------------------

pub const KIND_NARRATIVE: &str = "narrative";
pub const KIND_CHARACTERS: &str = "characters";
pub const KIND_WORLDBUILDING: &str = "worldbuilding";
pub const KIND_OUTLINE: &str = "outline";
pub const KIND_ADVANCED_PLAN: &str = "advanced_plan";

pub fn draft_scene_kind(scene: u32) -> String {
    format!("draft_scene_{scene}")
}

pub fn critique_scene_kind(scene: u32) -> String {
    format!("critique_scene_{scene}")
}

pub fn revision_scene_kind(scene: u32) -> String {
    format!("revision_scene_{scene}")
}

pub fn expanded_scene_kind(scene: u32) -> String {
    format!("expanded_scene_{scene}")
}

pub fn final_scene_kind(scene: u32) -> String {
    format!("final_scene_{scene}")
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("artifact store backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// ArtifactStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Save (upsert) one artifact body under `(run_id, kind)`.
    async fn save(&self, run_id: Uuid, kind: &str, body: Value) -> Result<(), ArtifactStoreError>;

    /// Load one artifact, if present.
    async fn load(&self, run_id: Uuid, kind: &str) -> Result<Option<Value>, ArtifactStoreError>;

    /// Every `(run_id, body)` pair saved under `kind`, across runs.
    async fn list_kind(&self, kind: &str) -> Result<Vec<(Uuid, Value)>, ArtifactStoreError>;

    /// Remove one artifact.
    async fn delete(&self, run_id: Uuid, kind: &str) -> Result<(), ArtifactStoreError>;

    // --- Typed upserts (normalized tables) ---

    async fn upsert_character(
        &self,
        project_id: &str,
        run_id: Uuid,
        character: &Character,
    ) -> Result<(), ArtifactStoreError> {
        let mut body = serde_json::to_value(character)
            .map_err(|e| ArtifactStoreError::Serialization(e.to_string()))?;
        body["project_id"] = Value::String(project_id.to_string());
        self.save(
            run_id,
            &format!("character_{}", character.name.to_lowercase().replace(' ', "_")),
            to_snake_keys(&body),
        )
        .await
    }

    async fn upsert_draft(
        &self,
        project_id: &str,
        run_id: Uuid,
        scene: u32,
        draft: &Draft,
    ) -> Result<(), ArtifactStoreError> {
        let mut body = serde_json::to_value(draft)
            .map_err(|e| ArtifactStoreError::Serialization(e.to_string()))?;
        body["project_id"] = Value::String(project_id.to_string());
        body["scene_number"] = Value::from(scene);
        self.save(run_id, &draft_scene_kind(scene), to_snake_keys(&body)).await
    }

    async fn upsert_critique(
        &self,
        project_id: &str,
        run_id: Uuid,
        scene: u32,
        critique: &Critique,
    ) -> Result<(), ArtifactStoreError> {
        let mut body = serde_json::to_value(critique)
            .map_err(|e| ArtifactStoreError::Serialization(e.to_string()))?;
        body["project_id"] = Value::String(project_id.to_string());
        body["scene_number"] = Value::from(scene);
        self.save(run_id, &critique_scene_kind(scene), to_snake_keys(&body)).await
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: DashMap<(Uuid, String), Value>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn save(&self, run_id: Uuid, kind: &str, body: Value) -> Result<(), ArtifactStoreError> {
        self.entries.insert((run_id, kind.to_string()), body);
        Ok(())
    }

    async fn load(&self, run_id: Uuid, kind: &str) -> Result<Option<Value>, ArtifactStoreError> {
        Ok(self
            .entries
            .get(&(run_id, kind.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn list_kind(&self, kind: &str) -> Result<Vec<(Uuid, Value)>, ArtifactStoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().1 == kind)
            .map(|entry| (entry.key().0, entry.value().clone()))
            .collect())
    }

    async fn delete(&self, run_id: Uuid, kind: &str) -> Result<(), ArtifactStoreError> {
        self.entries.remove(&(run_id, kind.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_load_round_trip() {
        let store = MemoryArtifactStore::new();
        let run_id = Uuid::new_v4();
        store
            .save(run_id, KIND_NARRATIVE, json!({"premise": "x"}))
            .await
            .unwrap();
        let loaded = store.load(run_id, KIND_NARRATIVE).await.unwrap();
        assert_eq!(loaded, Some(json!({"premise": "x"})));
    }

    #[tokio::test]
    async fn save_is_upsert() {
        let store = MemoryArtifactStore::new();
        let run_id = Uuid::new_v4();
        store.save(run_id, KIND_OUTLINE, json!({"v": 1})).await.unwrap();
        store.save(run_id, KIND_OUTLINE, json!({"v": 2})).await.unwrap();
        assert_eq!(store.load(run_id, KIND_OUTLINE).await.unwrap(), Some(json!({"v": 2})));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn list_kind_spans_runs() {
        let store = MemoryArtifactStore::new();
        store.save(Uuid::new_v4(), "run_state_snapshot", json!(1)).await.unwrap();
        store.save(Uuid::new_v4(), "run_state_snapshot", json!(2)).await.unwrap();
        store.save(Uuid::new_v4(), KIND_OUTLINE, json!(3)).await.unwrap();
        let snapshots = store.list_kind("run_state_snapshot").await.unwrap();
        assert_eq!(snapshots.len(), 2);
    }

    #[tokio::test]
    async fn typed_upserts_are_snake_cased() {
        let store = MemoryArtifactStore::new();
        let run_id = Uuid::new_v4();
        let draft = Draft::new("Arrival", "fog rolled in over the rocks");
        store.upsert_draft("proj-1", run_id, 1, &draft).await.unwrap();
        let saved = store.load(run_id, &draft_scene_kind(1)).await.unwrap().unwrap();
        assert!(saved.get("word_count").is_some());
        assert_eq!(saved["scene_number"], json!(1));
        assert_eq!(saved["project_id"], json!("proj-1"));
    }
}
