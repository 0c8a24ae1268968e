use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constraint::ConstraintStore;
use crate::phase::Phase;
use crate::world_state::WorldState;

// ---------------------------------------------------------------------------
// GenerationMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    Full,
    Branching,
}

// ---------------------------------------------------------------------------
// LlmSettings
// ---------------------------------------------------------------------------

/// Per-run LLM configuration supplied by the client at start time.
///
/// Accepts both camelCase and snake_case spellings for back-compat with
/// older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    pub provider: String,
    pub model: String,
    #[serde(alias = "apiKey", default)]
    pub api_key: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: String::new(),
            api_key: String::new(),
            temperature: default_temperature(),
        }
    }
}

// ---------------------------------------------------------------------------
// Narrative
// ---------------------------------------------------------------------------

/// The genesis artifact: the story's foundational concept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    #[serde(default)]
    pub premise: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default, alias = "narrativeArc", alias = "narrative_arc")]
    pub arc: String,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub hook: String,
}

// ---------------------------------------------------------------------------
// Character
// ---------------------------------------------------------------------------

/// A character record produced by the Profiler agent.
///
/// `role` is stored post-normalization: one of `protagonist`, `antagonist`,
/// `supporting`, or a lowercased free-form role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub psychology: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub arc: Option<String>,
}

// ---------------------------------------------------------------------------
// WorldElement
// ---------------------------------------------------------------------------

/// A worldbuilding element, keyed by element type in the run's
/// `worldbuilding` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldElement {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten, default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    #[serde(default)]
    pub scenes: Vec<SceneOutline>,
}

/// One planned scene in the outline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneOutline {
    #[serde(alias = "sceneNumber", default)]
    pub scene_number: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub setting: Option<String>,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(alias = "wordCount", default)]
    pub word_count: usize,
    #[serde(default)]
    pub hook: Option<String>,
    #[serde(alias = "futureEvents", default)]
    pub future_events: Vec<String>,
}

// ---------------------------------------------------------------------------
// Draft
// ---------------------------------------------------------------------------

/// Lifecycle status of a scene draft. The last four variants are the
/// terminal polish outcomes reported in `scene_polish_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Draft,
    Revised,
    Polished,
    PolishRejected,
    SkippedHighScore,
    NotApproved,
}

impl DraftStatus {
    /// True once the scene has been finalized (one way or another).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DraftStatus::Draft | DraftStatus::Revised)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Draft => "draft",
            DraftStatus::Revised => "revised",
            DraftStatus::Polished => "polished",
            DraftStatus::PolishRejected => "polish_rejected",
            DraftStatus::SkippedHighScore => "skipped_high_score",
            DraftStatus::NotApproved => "not_approved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub title: String,
    pub content: String,
    pub word_count: usize,
    pub revision_number: u32,
    pub status: DraftStatus,
    pub created_at: DateTime<Utc>,
}

impl Draft {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let word_count = count_words(&content);
        Self {
            title: title.into(),
            content,
            word_count,
            revision_number: 0,
            status: DraftStatus::Draft,
            created_at: Utc::now(),
        }
    }

    /// Replace the content, recomputing the word count.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.word_count = count_words(&self.content);
    }
}

/// Whitespace-separated word count, the measure used everywhere a target
/// word count is compared against produced prose.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

// ---------------------------------------------------------------------------
// Critique
// ---------------------------------------------------------------------------

/// A critic verdict for one scene draft.
///
/// `revision_needed` is the canonical revision-decision field; the
/// normalizer accepts the legacy `revisionNeeded` spelling and writes both
/// spellings back out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(alias = "revisionNeeded", default)]
    pub revision_needed: Option<bool>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(alias = "revisionRequests", default)]
    pub revision_requests: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(alias = "wordCountCompliance", default)]
    pub word_count_compliance: Option<bool>,
    #[serde(alias = "scopeAdherence", default)]
    pub scope_adherence: Option<bool>,
}

// ---------------------------------------------------------------------------
// RawFact
// ---------------------------------------------------------------------------

/// An un-curated observation extracted from generated prose; input to the
/// Archivist. Append-only: the Archivist consumes the suffix since its
/// previous pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFact {
    pub fact: String,
    /// Agent id that produced the fact.
    pub source: String,
    pub scene_number: u32,
    pub timestamp: DateTime<Utc>,
}

impl RawFact {
    pub fn new(fact: impl Into<String>, source: impl Into<String>, scene_number: u32) -> Self {
        Self {
            fact: fact.into(),
            source: source.into(),
            scene_number,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// GenerationRun
// ---------------------------------------------------------------------------

/// The full state of one generation run. Owned exclusively by the run task;
/// all other accessors read through [`RunStatus`] projections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRun {
    pub run_id: Uuid,
    pub project_id: String,
    pub seed_idea: String,
    pub llm: LlmSettings,
    pub mode: GenerationMode,
    pub phase: Phase,
    /// 1-based index of the scene currently being drafted.
    pub current_scene: u32,
    pub total_scenes: u32,
    pub is_paused: bool,
    pub is_completed: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // --- Artifacts ---
    pub narrative: Option<Narrative>,
    pub characters: Vec<Character>,
    pub worldbuilding: BTreeMap<String, WorldElement>,
    pub outline: Option<Outline>,
    pub drafts: BTreeMap<u32, Draft>,
    pub critiques: BTreeMap<u32, Vec<Critique>>,
    pub revision_count: BTreeMap<u32, u32>,

    // --- Continuity state ---
    pub raw_facts: Vec<RawFact>,
    pub constraints: ConstraintStore,
    pub world_state: WorldState,
    pub last_archivist_scene: u32,
    /// Cleared after every scene.
    pub current_scene_outline: Option<SceneOutline>,
}

impl GenerationRun {
    pub fn new(
        project_id: impl Into<String>,
        seed_idea: impl Into<String>,
        llm: LlmSettings,
        mode: GenerationMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            project_id: project_id.into(),
            seed_idea: seed_idea.into(),
            llm,
            mode,
            phase: Phase::Genesis,
            current_scene: 0,
            total_scenes: 0,
            is_paused: false,
            is_completed: false,
            error: None,
            started_at: now,
            updated_at: now,
            narrative: None,
            characters: Vec::new(),
            worldbuilding: BTreeMap::new(),
            outline: None,
            drafts: BTreeMap::new(),
            critiques: BTreeMap::new(),
            revision_count: BTreeMap::new(),
            raw_facts: Vec::new(),
            constraints: ConstraintStore::new(),
            world_state: WorldState::default(),
            last_archivist_scene: 0,
            current_scene_outline: None,
        }
    }

    /// Bump the `updated_at` timestamp after a mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Revisions consumed so far for `scene`.
    pub fn revisions_for(&self, scene: u32) -> u32 {
        self.revision_count.get(&scene).copied().unwrap_or(0)
    }

    /// Read-only projection for status queries.
    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.run_id,
            project_id: self.project_id.clone(),
            phase: self.phase,
            current_scene: self.current_scene,
            total_scenes: self.total_scenes,
            is_paused: self.is_paused,
            is_completed: self.is_completed,
            error: self.error.clone(),
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// What status queries and run listings return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub project_id: String,
    pub phase: Phase,
    pub current_scene: u32,
    pub total_scenes: u32,
    pub is_paused: bool,
    pub is_completed: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
