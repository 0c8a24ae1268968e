//! Fire-and-forget scene evaluations.
//!
//! After each scene is finalized, a relevance evaluation (did retrieval
//! surface the right context?) and a faithfulness evaluation (does the
//! prose respect the key constraints?) are spawned through the shared
//! [`EvaluationLimiter`]. They never block the generation critical path and
//! their failures are logged, not raised.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use sf_harness::eval_limiter::EvaluationLimiter;
use sf_harness::prompts::fallback;
use sf_harness::vector_store::{MemoryKind, VectorStore};
use tracing::{debug, info};

use crate::normalizer;
use crate::roles::AgentRole;
use crate::runner::{AgentRunner, RunOptions};

#[allow(clippy::too_many_arguments)]
pub fn spawn_scene_evaluations(
    evals: &EvaluationLimiter,
    runner: AgentRunner,
    vector: Arc<dyn VectorStore>,
    project_id: String,
    scene: u32,
    query: String,
    context_block: String,
    constraints_block: String,
    content: String,
) {
    {
        let runner = runner.clone();
        let vector = vector.clone();
        let project_id = project_id.clone();
        let _ = evals.spawn("relevance", async move {
            let vars = HashMap::from([
                ("query".to_string(), query),
                ("context".to_string(), context_block),
            ]);
            run_evaluation(
                &runner,
                &vector,
                &project_id,
                scene,
                "relevance",
                "relevance_evaluator",
                fallback::RELEVANCE_EVALUATOR,
                vars,
            )
            .await;
        });
    }

    let _ = evals.spawn("faithfulness", async move {
        let vars = HashMap::from([
            ("constraints".to_string(), constraints_block),
            ("content".to_string(), content),
        ]);
        run_evaluation(
            &runner,
            &vector,
            &project_id,
            scene,
            "faithfulness",
            "faithfulness_evaluator",
            fallback::FAITHFULNESS_EVALUATOR,
            vars,
        )
        .await;
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_evaluation(
    runner: &AgentRunner,
    vector: &Arc<dyn VectorStore>,
    project_id: &str,
    scene: u32,
    kind: &str,
    prompt_name: &str,
    fallback: &str,
    vars: HashMap<String, String>,
) {
    let output = match runner
        .run(AgentRole::Critic, prompt_name, fallback, &vars, &RunOptions::default())
        .await
    {
        Ok(output) => output,
        Err(err) => {
            debug!(scene, kind, error = %err, "evaluation call failed, skipping");
            return;
        }
    };

    let Some(value) = normalizer::extract_json(&output.content) else {
        debug!(scene, kind, "evaluation output was not JSON, skipping");
        return;
    };
    let score = value.get("score").and_then(serde_json::Value::as_f64);
    info!(scene, kind, score, "scene evaluation recorded");

    let payload = json!({
        "scene_number": scene,
        "kind": kind,
        "score": score,
        "detail": value,
    });
    if let Err(err) = vector.store(project_id, MemoryKind::Evaluation, payload).await {
        debug!(scene, kind, error = %err, "failed to store evaluation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_harness::prompts::BuiltinPromptStore;
    use sf_harness::provider::MockProvider;
    use sf_harness::vector_store::MemoryVectorStore;
    use std::time::Duration;

    #[tokio::test]
    async fn evaluations_store_scores_off_the_critical_path() {
        let mock = MockProvider::new();
        mock.push_content(r#"{"score": 0.9, "rationale": "on point"}"#);
        mock.push_content(r#"{"score": 0.8, "contradictions": []}"#);
        let runner = AgentRunner::new(
            Arc::new(mock),
            Arc::new(BuiltinPromptStore::default()),
            "mock-model",
        );
        let vector: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let evals = EvaluationLimiter::new(3);

        spawn_scene_evaluations(
            &evals,
            runner,
            vector.clone(),
            "p1".into(),
            1,
            "query".into(),
            "context".into(),
            "- genre: mystery\n".into(),
            "the scene text".into(),
        );

        // Wait for the spawned tasks to drain.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let stored = vector.scroll("p1", MemoryKind::Evaluation).await.unwrap();
            if stored.len() == 2 {
                return;
            }
        }
        panic!("evaluations did not complete");
    }

    #[tokio::test]
    async fn evaluation_failures_are_swallowed() {
        let mock = MockProvider::new();
        mock.push_content("not json at all");
        mock.push_content("also not json");
        let runner = AgentRunner::new(
            Arc::new(mock),
            Arc::new(BuiltinPromptStore::default()),
            "mock-model",
        );
        let vector: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let evals = EvaluationLimiter::new(3);

        spawn_scene_evaluations(
            &evals,
            runner,
            vector.clone(),
            "p1".into(),
            1,
            "q".into(),
            "c".into(),
            "k".into(),
            "s".into(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stored = vector.scroll("p1", MemoryKind::Evaluation).await.unwrap();
        assert!(stored.is_empty());
    }
}
