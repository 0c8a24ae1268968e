//! Per-scene context retrieval from the vector memory.

use serde_json::Value;
use sf_core::types::SceneOutline;
use sf_harness::vector_store::{MemoryKind, VectorStore, VectorStoreError};

/// Results below this similarity are noise and excluded.
pub const MIN_SIMILARITY: f32 = 0.5;

const CHARACTER_LIMIT: usize = 3;
const WORLD_LIMIT: usize = 3;
const SCENE_LIMIT: usize = 2;

/// Context assembled for one Writer call.
#[derive(Debug, Default, Clone)]
pub struct SceneContext {
    pub characters: Vec<Value>,
    pub world_elements: Vec<Value>,
    pub previous_scenes: Vec<Value>,
}

impl SceneContext {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.world_elements.is_empty() && self.previous_scenes.is_empty()
    }

    /// Deterministic rendering for prompt injection.
    pub fn render_block(&self) -> String {
        let mut out = String::new();
        render_section(&mut out, "Characters", &self.characters);
        render_section(&mut out, "World", &self.world_elements);
        render_section(&mut out, "Previous scenes", &self.previous_scenes);
        if out.is_empty() {
            out.push_str("(no retrieved context)\n");
        }
        out
    }
}

fn render_section(out: &mut String, heading: &str, payloads: &[Value]) {
    if payloads.is_empty() {
        return;
    }
    out.push_str(heading);
    out.push_str(":\n");
    for payload in payloads {
        out.push_str("- ");
        out.push_str(&summarize(payload));
        out.push('\n');
    }
}

fn summarize(payload: &Value) -> String {
    match payload {
        Value::Object(map) => {
            let name = map
                .get("name")
                .or_else(|| map.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let body = map
                .get("description")
                .or_else(|| map.get("content"))
                .or_else(|| map.get("summary"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let mut line = String::new();
            if !name.is_empty() {
                line.push_str(name);
                if !body.is_empty() {
                    line.push_str(": ");
                }
            }
            // Keep prompt size bounded.
            line.extend(body.chars().take(400));
            line
        }
        other => other.to_string(),
    }
}

/// The query string the scene is matched against: title + setting +
/// characters present.
pub fn scene_query(outline: &SceneOutline) -> String {
    let mut query = outline.title.clone();
    if let Some(setting) = outline.setting.as_deref() {
        query.push(' ');
        query.push_str(setting);
    }
    for character in &outline.characters {
        query.push(' ');
        query.push_str(character);
    }
    query
}

/// Retrieve up to 3 characters, 3 world elements, and 2 previous scenes
/// with similarity >= 0.5.
pub async fn fetch(
    vector: &dyn VectorStore,
    project_id: &str,
    outline: &SceneOutline,
) -> Result<SceneContext, VectorStoreError> {
    let query = scene_query(outline);

    let characters = filtered(vector, project_id, MemoryKind::Character, &query, CHARACTER_LIMIT).await?;
    let world_elements = filtered(vector, project_id, MemoryKind::WorldElement, &query, WORLD_LIMIT).await?;
    let previous_scenes = filtered(vector, project_id, MemoryKind::Scene, &query, SCENE_LIMIT).await?;

    Ok(SceneContext {
        characters,
        world_elements,
        previous_scenes,
    })
}

async fn filtered(
    vector: &dyn VectorStore,
    project_id: &str,
    kind: MemoryKind,
    query: &str,
    limit: usize,
) -> Result<Vec<Value>, VectorStoreError> {
    Ok(vector
        .search(project_id, kind, query, limit)
        .await?
        .into_iter()
        .filter(|hit| hit.score >= MIN_SIMILARITY)
        .map(|hit| hit.payload)
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sf_harness::vector_store::MemoryVectorStore;

    fn outline() -> SceneOutline {
        SceneOutline {
            scene_number: 2,
            title: "The Lantern".into(),
            setting: Some("lighthouse gallery".into()),
            characters: vec!["Elena".into()],
            word_count: 800,
            ..SceneOutline::default()
        }
    }

    #[tokio::test]
    async fn fetch_filters_below_threshold() {
        let store = MemoryVectorStore::new();
        store
            .store("p1", MemoryKind::Character, json!({"name": "Elena", "description": "keeper of the lighthouse lantern"}))
            .await
            .unwrap();
        store
            .store("p1", MemoryKind::Character, json!({"name": "Unrelated", "description": "a merchant from the capital"}))
            .await
            .unwrap();

        let context = fetch(&store, "p1", &outline()).await.unwrap();
        assert_eq!(context.characters.len(), 1);
        assert_eq!(context.characters[0]["name"], json!("Elena"));
    }

    #[tokio::test]
    async fn empty_store_renders_placeholder() {
        let store = MemoryVectorStore::new();
        let context = fetch(&store, "p1", &outline()).await.unwrap();
        assert!(context.is_empty());
        assert!(context.render_block().contains("no retrieved context"));
    }

    #[test]
    fn query_concatenates_title_setting_characters() {
        let query = scene_query(&outline());
        assert!(query.contains("The Lantern"));
        assert!(query.contains("lighthouse gallery"));
        assert!(query.contains("Elena"));
    }
}
