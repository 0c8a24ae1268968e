//! Vector memory abstraction.
//!
//! The drafting engine retrieves semantically similar characters, world
//! elements, and previous scenes before each Writer call. The production
//! deployment points this trait at an external vector database; the
//! in-memory implementation scores by token overlap, which is enough for
//! the engine's similarity-threshold logic and for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("vector store backend error: {0}")]
    Backend(String),
}

/// What kind of memory a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Character,
    WorldElement,
    Scene,
    Evaluation,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Character => "character",
            MemoryKind::WorldElement => "world_element",
            MemoryKind::Scene => "scene",
            MemoryKind::Evaluation => "evaluation",
        }
    }
}

/// A search hit with its similarity score in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct Scored {
    pub score: f32,
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// VectorStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn store(
        &self,
        project_id: &str,
        kind: MemoryKind,
        payload: Value,
    ) -> Result<(), VectorStoreError>;

    /// Top-`limit` payloads by similarity to `query`, best first.
    async fn search(
        &self,
        project_id: &str,
        kind: MemoryKind,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Scored>, VectorStoreError>;

    /// All payloads of a kind, in insertion order.
    async fn scroll(
        &self,
        project_id: &str,
        kind: MemoryKind,
    ) -> Result<Vec<Value>, VectorStoreError>;
}

// ---------------------------------------------------------------------------
// MemoryVectorStore
// ---------------------------------------------------------------------------

/// In-memory store scoring by lowercase token overlap: the fraction of
/// query tokens that appear in the payload's text fields.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    entries: DashMap<(String, &'static str), Vec<Value>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn payload_text(payload: &Value) -> String {
        let mut text = String::new();
        collect_strings(payload, &mut text);
        text.to_lowercase()
    }

    fn similarity(query: &str, payload: &Value) -> f32 {
        let text = Self::payload_text(payload);
        let tokens: Vec<&str> = query
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .collect();
        if tokens.is_empty() {
            return 0.0;
        }
        let hits = tokens
            .iter()
            .filter(|t| text.contains(&t.to_lowercase()))
            .count();
        hits as f32 / tokens.len() as f32
    }
}

fn collect_strings(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn store(
        &self,
        project_id: &str,
        kind: MemoryKind,
        payload: Value,
    ) -> Result<(), VectorStoreError> {
        self.entries
            .entry((project_id.to_string(), kind.as_str()))
            .or_default()
            .push(payload);
        Ok(())
    }

    async fn search(
        &self,
        project_id: &str,
        kind: MemoryKind,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Scored>, VectorStoreError> {
        let mut scored: Vec<Scored> = self
            .entries
            .get(&(project_id.to_string(), kind.as_str()))
            .map(|entries| {
                entries
                    .iter()
                    .map(|payload| Scored {
                        score: Self::similarity(query, payload),
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn scroll(
        &self,
        project_id: &str,
        kind: MemoryKind,
    ) -> Result<Vec<Value>, VectorStoreError> {
        Ok(self
            .entries
            .get(&(project_id.to_string(), kind.as_str()))
            .map(|entries| entries.value().clone())
            .unwrap_or_default())
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
    async fn search_ranks_by_overlap() {
        let store = MemoryVectorStore::new();
        store
            .store("p1", MemoryKind::Character, json!({"name": "Elena", "description": "lighthouse keeper"}))
            .await
            .unwrap();
        store
            .store("p1", MemoryKind::Character, json!({"name": "Marcus", "description": "harbor master"}))
            .await
            .unwrap();

        let hits = store
            .search("p1", MemoryKind::Character, "the lighthouse keeper Elena", 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload["name"], json!("Elena"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn scroll_preserves_insertion_order() {
        let store = MemoryVectorStore::new();
        store.store("p1", MemoryKind::Scene, json!({"n": 1})).await.unwrap();
        store.store("p1", MemoryKind::Scene, json!({"n": 2})).await.unwrap();
        let all = store.scroll("p1", MemoryKind::Scene).await.unwrap();
        assert_eq!(all, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn kinds_are_isolated() {
        let store = MemoryVectorStore::new();
        store.store("p1", MemoryKind::Scene, json!({"n": 1})).await.unwrap();
        let hits = store.search("p1", MemoryKind::Character, "anything", 5).await.unwrap();
        assert!(hits.is_empty());
    }
}
