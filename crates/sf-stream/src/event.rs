use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// Every event type the core emits. Wire names are snake_case except the
/// terminal `ERROR`, which is uppercase for historical reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    GenerationStarted,
    PhaseStart,
    PhaseComplete,
    SceneDraftStart,
    SceneBeatStart,
    SceneBeatComplete,
    SceneBeatError,
    SceneDraftComplete,
    SceneExpandStart,
    SceneExpandComplete,
    SceneCritiqueStart,
    SceneCritiqueComplete,
    SceneRevisionStart,
    SceneRevisionComplete,
    ScenePolishStart,
    ScenePolishComplete,
    ArchivistStart,
    ArchivistComplete,
    NewDevelopmentsCollected,
    ShutdownInitiated,
    RunRestored,
    ValidationError,
    /// Legacy companion of `ERROR`, kept for old consumers.
    GenerationError,
    #[serde(rename = "ERROR")]
    Error,
    GenerationCompleted,
}

impl EventType {
    /// Terminal events end the stream for every consumer.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Error | EventType::GenerationCompleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::GenerationStarted => "generation_started",
            EventType::PhaseStart => "phase_start",
            EventType::PhaseComplete => "phase_complete",
            EventType::SceneDraftStart => "scene_draft_start",
            EventType::SceneBeatStart => "scene_beat_start",
            EventType::SceneBeatComplete => "scene_beat_complete",
            EventType::SceneBeatError => "scene_beat_error",
            EventType::SceneDraftComplete => "scene_draft_complete",
            EventType::SceneExpandStart => "scene_expand_start",
            EventType::SceneExpandComplete => "scene_expand_complete",
            EventType::SceneCritiqueStart => "scene_critique_start",
            EventType::SceneCritiqueComplete => "scene_critique_complete",
            EventType::SceneRevisionStart => "scene_revision_start",
            EventType::SceneRevisionComplete => "scene_revision_complete",
            EventType::ScenePolishStart => "scene_polish_start",
            EventType::ScenePolishComplete => "scene_polish_complete",
            EventType::ArchivistStart => "archivist_start",
            EventType::ArchivistComplete => "archivist_complete",
            EventType::NewDevelopmentsCollected => "new_developments_collected",
            EventType::ShutdownInitiated => "shutdown_initiated",
            EventType::RunRestored => "run_restored",
            EventType::ValidationError => "validation_error",
            EventType::GenerationError => "generation_error",
            EventType::Error => "ERROR",
            EventType::GenerationCompleted => "generation_completed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One stream record. `id` is monotonic within a run, starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub run_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_serializes_uppercase() {
        let json = serde_json::to_string(&EventType::Error).unwrap();
        assert_eq!(json, "\"ERROR\"");
    }

    #[test]
    fn other_types_serialize_snake_case() {
        let json = serde_json::to_string(&EventType::ScenePolishComplete).unwrap();
        assert_eq!(json, "\"scene_polish_complete\"");
    }

    #[test]
    fn only_error_and_completed_are_terminal() {
        assert!(EventType::Error.is_terminal());
        assert!(EventType::GenerationCompleted.is_terminal());
        assert!(!EventType::GenerationError.is_terminal());
        assert!(!EventType::PhaseComplete.is_terminal());
    }

    #[test]
    fn event_wire_shape_uses_type_key() {
        let event = Event {
            id: 1,
            run_id: Uuid::nil(),
            event_type: EventType::PhaseStart,
            timestamp: Utc::now(),
            data: serde_json::json!({"phase": "genesis"}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], serde_json::json!("phase_start"));
        assert_eq!(value["data"]["phase"], serde_json::json!("genesis"));
    }
}
