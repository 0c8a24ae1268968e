use std::sync::Arc;
use std::time::Duration;

use sf_agents::drafting::SceneDraftingEngine;
use sf_agents::runner::AgentRunner;
use sf_core::config::EngineConfig;
use sf_core::types::{DraftStatus, GenerationMode, GenerationRun, LlmSettings, SceneOutline};
use sf_harness::eval_limiter::EvaluationLimiter;
use sf_harness::prompts::BuiltinPromptStore;
use sf_harness::provider::MockProvider;
use sf_harness::shutdown::{ShutdownSignal, StopToken};
use sf_harness::vector_store::MemoryVectorStore;
use sf_stream::{EventLog, EventType};

fn prose(words: usize, tag: &str) -> String {
    (0..words)
        .map(|i| format!("{tag}{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn engine_with(mock: &MockProvider, config: EngineConfig) -> (SceneDraftingEngine, EventLog) {
    let events = EventLog::new();
    let runner = AgentRunner::new(
        Arc::new(mock.clone()),
        Arc::new(BuiltinPromptStore::default()),
        "mock-model",
    )
    .with_backoff_base(Duration::from_millis(1));
    let engine = SceneDraftingEngine::new(
        runner,
        Arc::new(MemoryVectorStore::new()),
        events.clone(),
        EvaluationLimiter::new(3),
        config,
    );
    (engine, events)
}

fn run() -> GenerationRun {
    GenerationRun::new(
        "proj-1",
        "a lighthouse keeper meets a stranger",
        LlmSettings::default(),
        GenerationMode::Full,
    )
}

fn outline(scene: u32, words: usize) -> SceneOutline {
    SceneOutline {
        scene_number: scene,
        title: format!("Scene {scene}"),
        setting: Some("the lighthouse".into()),
        characters: vec!["Elena".into()],
        word_count: words,
        ..SceneOutline::default()
    }
}

fn stop() -> StopToken {
    StopToken::new(ShutdownSignal::new())
}

fn event_types(events: &EventLog, run: &GenerationRun) -> Vec<EventType> {
    events
        .range(run.run_id, 0, 10_000)
        .iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn short_scene_with_high_score_skips_polish() {
    let mock = MockProvider::new();
    mock.route("You are the Writer. Draft scene", prose(600, "w"));
    mock.route("You are the Critic", r#"{"score": 9, "revision_needed": false}"#);
    mock.route("You are evaluating", r#"{"score": 0.9}"#);

    let (engine, events) = engine_with(&mock, EngineConfig::default());
    let mut run = run();
    let outline = outline(1, 600);

    let result = engine.draft_scene(&mut run, &outline, &stop()).await.unwrap();
    assert_eq!(result.status, DraftStatus::SkippedHighScore);
    assert_eq!(result.word_count, 600);

    let types = event_types(&events, &run);
    let positions: Vec<usize> = [
        EventType::SceneDraftStart,
        EventType::SceneDraftComplete,
        EventType::SceneCritiqueStart,
        EventType::SceneCritiqueComplete,
        EventType::ScenePolishComplete,
    ]
    .iter()
    .map(|t| types.iter().position(|x| x == t).expect("event missing"))
    .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    // Exactly one terminal scene event.
    assert_eq!(
        types.iter().filter(|t| **t == EventType::ScenePolishComplete).count(),
        1
    );
    // No polish call was made.
    assert_eq!(
        types.iter().filter(|t| **t == EventType::ScenePolishStart).count(),
        0
    );
}

#[tokio::test]
async fn long_scene_runs_beats_mode() {
    let mock = MockProvider::new();
    mock.route_sequence(
        "in parts",
        (0..4).map(|i| prose(480, &format!("part{i}x"))).collect(),
    );
    mock.route("You are the Critic", r#"{"score": 9, "revision_needed": false}"#);
    mock.route("You are evaluating", r#"{"score": 0.9}"#);

    let (engine, events) = engine_with(&mock, EngineConfig::default());
    let mut run = run();
    let outline = outline(1, 1800);

    let result = engine.draft_scene(&mut run, &outline, &stop()).await.unwrap();
    assert_eq!(result.status, DraftStatus::SkippedHighScore);

    let all = events.range(run.run_id, 0, 10_000);
    let beat_completes: Vec<_> = all
        .iter()
        .filter(|e| e.event_type == EventType::SceneBeatComplete)
        .collect();
    assert_eq!(beat_completes.len(), 4);
    for (i, event) in beat_completes.iter().enumerate() {
        assert_eq!(event.data["partIndex"], serde_json::json!(i + 1));
        assert_eq!(event.data["partsTotal"], serde_json::json!(4));
    }

    let draft_complete = all
        .iter()
        .find(|e| e.event_type == EventType::SceneDraftComplete)
        .unwrap();
    assert_eq!(draft_complete.data["method"], serde_json::json!("beats"));
    assert_eq!(draft_complete.data["partsGenerated"], serde_json::json!(4));
}

#[tokio::test]
async fn starved_beat_fails_after_three_attempts() {
    let mock = MockProvider::new();
    // Every part comes back far under half the part target.
    mock.route("in parts", prose(40, "thin"));

    let (engine, events) = engine_with(&mock, EngineConfig::default());
    let mut run = run();
    let outline = outline(1, 1800);

    let err = engine.draft_scene(&mut run, &outline, &stop()).await.unwrap_err();
    assert!(err.to_string().contains("insufficient"));

    let types = event_types(&events, &run);
    assert_eq!(
        types.iter().filter(|t| **t == EventType::SceneBeatError).count(),
        3
    );
}

#[tokio::test]
async fn lazy_polish_is_rejected_and_pre_polish_content_kept() {
    let scene_text = prose(600, "w");
    let mock = MockProvider::new();
    mock.route("You are the Writer. Draft scene", scene_text.clone());
    // Approved but below the polish-skip threshold.
    mock.route("You are the Critic", r#"{"score": 7.5, "revision_needed": false}"#);
    mock.route(
        "polishing scene",
        format!("{scene_text} (Note: the rest is the same as the original draft.)"),
    );
    mock.route("You are evaluating", r#"{"score": 0.9}"#);

    let (engine, events) = engine_with(&mock, EngineConfig::default());
    let mut run = run();
    let outline = outline(1, 600);

    let result = engine.draft_scene(&mut run, &outline, &stop()).await.unwrap();
    assert_eq!(result.status, DraftStatus::PolishRejected);

    let draft = &run.drafts[&1];
    assert_eq!(draft.content, scene_text);
    assert_eq!(draft.status, DraftStatus::PolishRejected);

    let all = events.range(run.run_id, 0, 10_000);
    let terminal = all
        .iter()
        .find(|e| e.event_type == EventType::ScenePolishComplete)
        .unwrap();
    assert_eq!(terminal.data["polishStatus"], serde_json::json!("polish_rejected"));
    assert_eq!(terminal.data["finalContent"], serde_json::json!(scene_text));
}

#[tokio::test]
async fn noncompliant_scene_expands_revises_and_ends_not_approved() {
    let mock = MockProvider::new();
    mock.route("You are the Writer. Draft scene", prose(400, "w"));
    // Expansions add almost nothing.
    mock.route("expanding scene", prose(110, "extra"));
    mock.route(
        "You are the Critic",
        r#"{"score": 5, "revision_needed": true, "issues": ["far too short"]}"#,
    );
    mock.route("revising scene", prose(500, "rev"));
    mock.route("You are evaluating", r#"{"score": 0.4}"#);

    // Raise the beats threshold so a 1500-word target drafts single-shot.
    let config = EngineConfig {
        beats_threshold: 2000,
        ..EngineConfig::default()
    };
    let (engine, events) = engine_with(&mock, config);
    let mut run = run();
    let outline = outline(1, 1500);

    let result = engine.draft_scene(&mut run, &outline, &stop()).await.unwrap();
    assert_eq!(result.status, DraftStatus::NotApproved);

    let types = event_types(&events, &run);
    // Three expansion rounds ran and still fell short of the minimum.
    assert_eq!(
        types.iter().filter(|t| **t == EventType::SceneExpandStart).count(),
        3
    );
    // The revision budget (2) bounds the loop: 3 critiques, 2 revisions.
    assert_eq!(
        types.iter().filter(|t| **t == EventType::SceneCritiqueComplete).count(),
        3
    );
    assert_eq!(
        types.iter().filter(|t| **t == EventType::SceneRevisionComplete).count(),
        2
    );
    assert_eq!(run.revisions_for(1), 2);

    // The terminal event is still emitted, exactly once.
    let terminal: Vec<_> = events
        .range(run.run_id, 0, 10_000)
        .into_iter()
        .filter(|e| e.event_type == EventType::ScenePolishComplete)
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].data["polishStatus"], serde_json::json!("not_approved"));
}

#[tokio::test]
async fn paused_token_stops_at_a_safepoint() {
    let mock = MockProvider::new();
    mock.route("You are the Writer. Draft scene", prose(600, "w"));

    let (engine, _events) = engine_with(&mock, EngineConfig::default());
    let mut run = run();
    let outline = outline(1, 600);

    let token = stop();
    token.set_paused(true);
    let err = engine.draft_scene(&mut run, &outline, &token).await.unwrap_err();
    assert!(matches!(err, sf_agents::drafting::DraftError::Stopped));
}

#[tokio::test]
async fn scene_outline_is_cleared_after_the_scene() {
    let mock = MockProvider::new();
    mock.route("You are the Writer. Draft scene", prose(600, "w"));
    mock.route("You are the Critic", r#"{"score": 9, "revision_needed": false}"#);
    mock.route("You are evaluating", r#"{"score": 0.9}"#);

    let (engine, _events) = engine_with(&mock, EngineConfig::default());
    let mut run = run();
    let outline = outline(1, 600);
    run.current_scene_outline = Some(outline.clone());

    engine.draft_scene(&mut run, &outline, &stop()).await.unwrap();
    assert!(run.current_scene_outline.is_none());
}
