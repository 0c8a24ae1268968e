//! Scene drafting engine.
//!
//! Produces exactly one finalized [`Draft`] per scene, robust to model
//! short-returns and content bloat: beats mode for long scenes, expansion
//! rounds for short single-shot drafts, a bounded critique/revision loop,
//! and validated polish. Whatever path a scene takes, exactly one
//! `scene_polish_complete` event is emitted for it.

pub mod beats;
pub mod context;
pub mod critic;
pub mod overlap;
pub mod polish;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use sf_core::config::EngineConfig;
use sf_core::constraint::ConstraintStore;
use sf_core::types::{count_words, Critique, Draft, DraftStatus, GenerationRun, RawFact, SceneOutline};
use sf_harness::eval_limiter::EvaluationLimiter;
use sf_harness::prompts::fallback;
use sf_harness::shutdown::StopToken;
use sf_harness::vector_store::{MemoryKind, VectorStore};
use sf_stream::{EventLog, EventType};
use thiserror::Error;
use tracing::{debug, warn};

use crate::evaluation;
use crate::normalizer;
use crate::roles::AgentRole;
use crate::runner::{AgentError, AgentRunner, RunOptions};

const MAX_EXPANSIONS: u32 = 3;

/// How much of the assembled scene is replayed into continuation prompts.
const PROMPT_TAIL_WORDS: usize = 500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DraftError {
    /// A beat failed to reach half its part target three times running.
    #[error("scene {scene} beat {part_index}/{parts_total} insufficient after {attempts} attempts")]
    BeatInsufficient {
        scene: u32,
        part_index: usize,
        parts_total: usize,
        attempts: u32,
    },
    #[error(transparent)]
    Agent(#[from] AgentError),
    /// A safepoint observed pause/cancel/shutdown; the scene is unfinished.
    #[error("stopped at a drafting safepoint")]
    Stopped,
}

// ---------------------------------------------------------------------------
// SceneResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SceneResult {
    pub status: DraftStatus,
    pub word_count: usize,
    pub score: Option<f64>,
    /// Expansion rounds the single-shot path needed (0 in beats mode).
    pub expansion_rounds: u32,
}

// ---------------------------------------------------------------------------
// SceneDraftingEngine
// ---------------------------------------------------------------------------

pub struct SceneDraftingEngine {
    runner: AgentRunner,
    vector: Arc<dyn VectorStore>,
    events: EventLog,
    evals: EvaluationLimiter,
    config: EngineConfig,
}

impl SceneDraftingEngine {
    pub fn new(
        runner: AgentRunner,
        vector: Arc<dyn VectorStore>,
        events: EventLog,
        evals: EvaluationLimiter,
        config: EngineConfig,
    ) -> Self {
        Self {
            runner,
            vector,
            events,
            evals,
            config,
        }
    }

    /// Drive one scene from context fetch through finalization. The caller
    /// (the run task) owns `run`; this method is its only mutator while a
    /// scene is in flight.
    pub async fn draft_scene(
        &self,
        run: &mut GenerationRun,
        outline: &SceneOutline,
        stop: &StopToken,
    ) -> Result<SceneResult, DraftError> {
        if stop.should_stop() {
            return Err(DraftError::Stopped);
        }
        let scene = outline.scene_number;
        let run_id = run.run_id;
        let target = outline.word_count;
        let min_words = (target as f64 * critic::WORD_COUNT_RATIO).floor() as usize;

        let scene_context = match context::fetch(self.vector.as_ref(), &run.project_id, outline).await {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(run_id = %run_id, scene, error = %err, "context fetch failed, drafting without");
                context::SceneContext::default()
            }
        };
        let context_block = scene_context.render_block();
        let constraints_block = ConstraintStore::render_block(&run.constraints.snapshot());
        let opts = RunOptions {
            temperature: run.llm.temperature,
            ..RunOptions::default()
        };

        // Draft: beats for long scenes, single shot plus expansion rounds
        // otherwise.
        let beats_mode = target > self.config.beats_threshold;
        let method = if beats_mode { "beats" } else { "single" };
        self.events.publish(
            run_id,
            EventType::SceneDraftStart,
            json!({"sceneNum": scene, "method": method}),
        );

        let (mut content, parts_generated) = if beats_mode {
            self.draft_beats(run_id, outline, &context_block, &constraints_block, &opts, stop)
                .await?
        } else {
            let content = self
                .draft_single(outline, &context_block, &constraints_block, &opts)
                .await?;
            (content, 1)
        };
        content = overlap::sanitize(&content);

        let mut expansion_rounds = 0;
        if !beats_mode {
            expansion_rounds = self
                .expand_if_short(run_id, scene, &mut content, min_words, &opts, stop)
                .await?;
        }

        let mut draft = Draft::new(outline.title.clone(), content.clone());
        run.drafts.insert(scene, draft.clone());
        run.touch();
        self.events.publish(
            run_id,
            EventType::SceneDraftComplete,
            json!({
                "sceneNum": scene,
                "wordCount": draft.word_count,
                "method": method,
                "partsGenerated": parts_generated,
            }),
        );

        // Critique loop, bounded by the revision budget.
        let mut approved = false;
        let mut last_score = None;
        loop {
            if stop.should_stop() {
                return Err(DraftError::Stopped);
            }

            self.events
                .publish(run_id, EventType::SceneCritiqueStart, json!({"sceneNum": scene}));
            let mut critique = self.run_critic(outline, &content, target).await?;
            let verdict = critic::finalize_critique(&mut critique, &content, target, outline);
            last_score = Some(critique.score);
            let wire = normalizer::critique_wire_form(&critique);
            run.critiques.entry(scene).or_default().push(critique.clone());
            run.touch();
            self.events.publish(
                run_id,
                EventType::SceneCritiqueComplete,
                json!({"sceneNum": scene, "critique": wire}),
            );

            if verdict.approved {
                approved = true;
                break;
            }
            let used = run.revisions_for(scene);
            if used >= self.config.max_revisions {
                debug!(run_id = %run_id, scene, "revision budget exhausted, exiting unapproved");
                break;
            }

            if stop.should_stop() {
                return Err(DraftError::Stopped);
            }
            self.events
                .publish(run_id, EventType::SceneRevisionStart, json!({"sceneNum": scene}));
            let revised = self.run_revision(outline, &content, &critique, &opts).await?;
            let revised = overlap::sanitize(&revised);
            if revised.trim().is_empty() {
                warn!(run_id = %run_id, scene, "revision returned empty content, keeping draft");
            } else {
                content = revised;
                draft.set_content(content.clone());
                draft.revision_number += 1;
                draft.status = DraftStatus::Revised;
                run.drafts.insert(scene, draft.clone());
            }
            run.revision_count.insert(scene, used + 1);
            run.touch();
            self.events
                .publish(run_id, EventType::SceneRevisionComplete, json!({"sceneNum": scene}));
        }

        collect_raw_facts(run, scene, &content);

        // Finalization: exactly one terminal event per scene.
        let status = if !approved {
            DraftStatus::NotApproved
        } else if last_score.unwrap_or(0.0) >= critic::APPROVAL_SCORE {
            DraftStatus::SkippedHighScore
        } else {
            match self.polish(run_id, scene, outline, &content, &opts, stop).await? {
                Some(polished) => {
                    content = polished;
                    DraftStatus::Polished
                }
                None => DraftStatus::PolishRejected,
            }
        };

        draft.set_content(content.clone());
        draft.status = status;
        run.drafts.insert(scene, draft.clone());
        self.events.publish(
            run_id,
            EventType::ScenePolishComplete,
            json!({
                "sceneNum": scene,
                "polishStatus": status.as_str(),
                "finalContent": content.clone(),
                "wordCount": draft.word_count,
            }),
        );

        self.remember_scene(run, outline, &content).await;
        evaluation::spawn_scene_evaluations(
            &self.evals,
            self.runner.clone(),
            self.vector.clone(),
            run.project_id.clone(),
            scene,
            context::scene_query(outline),
            context_block,
            constraints_block,
            content,
        );

        run.current_scene_outline = None;
        run.touch();

        Ok(SceneResult {
            status,
            word_count: draft.word_count,
            score: last_score,
            expansion_rounds,
        })
    }

    // -----------------------------------------------------------------------
    // Single-shot path
    // -----------------------------------------------------------------------

    async fn draft_single(
        &self,
        outline: &SceneOutline,
        context_block: &str,
        constraints_block: &str,
        opts: &RunOptions,
    ) -> Result<String, DraftError> {
        let vars = scene_vars(outline, context_block, constraints_block);
        let out = self
            .runner
            .run(AgentRole::Writer, "writer_draft", fallback::WRITER_DRAFT, &vars, opts)
            .await?;
        Ok(out.content)
    }

    /// Up to three expansion rounds while the draft is under the minimum.
    /// Rounds whose continuation strips to nothing leave the content as-is;
    /// a draft still short after three rounds proceeds to the Critic anyway.
    /// Returns the number of rounds run.
    async fn expand_if_short(
        &self,
        run_id: uuid::Uuid,
        scene: u32,
        content: &mut String,
        min_words: usize,
        opts: &RunOptions,
        stop: &StopToken,
    ) -> Result<u32, DraftError> {
        let mut rounds = 0;
        while count_words(content) < min_words && rounds < MAX_EXPANSIONS {
            if stop.should_stop() {
                return Err(DraftError::Stopped);
            }
            rounds += 1;
            let current = count_words(content);
            self.events.publish(
                run_id,
                EventType::SceneExpandStart,
                json!({
                    "sceneNum": scene,
                    "round": rounds,
                    "currentWords": current,
                    "additionalWordsNeeded": min_words.saturating_sub(current),
                }),
            );

            let vars = HashMap::from([
                ("scene_number".to_string(), scene.to_string()),
                ("existing_content".to_string(), tail_words(content, PROMPT_TAIL_WORDS)),
                (
                    "additional_words".to_string(),
                    min_words.saturating_sub(current).to_string(),
                ),
            ]);
            let out = self
                .runner
                .run(AgentRole::Writer, "writer_expand", fallback::WRITER_EXPAND, &vars, opts)
                .await?;

            match overlap::try_strip(content, &out.content) {
                overlap::StripOutcome::Stripped(fresh) => {
                    content.push_str("\n\n");
                    content.push_str(overlap::sanitize(&fresh).as_str());
                }
                overlap::StripOutcome::NoOverlap => {
                    let fresh = overlap::sanitize(&out.content);
                    if !fresh.is_empty() {
                        content.push_str("\n\n");
                        content.push_str(&fresh);
                    }
                }
                overlap::StripOutcome::WouldEmpty => {
                    debug!(run_id = %run_id, scene, round = rounds, "expansion stripped to nothing, keeping content");
                }
            }

            self.events.publish(
                run_id,
                EventType::SceneExpandComplete,
                json!({
                    "sceneNum": scene,
                    "round": rounds,
                    "wordCount": count_words(content),
                    "assembledContent": content.clone(),
                }),
            );
        }
        Ok(rounds)
    }

    // -----------------------------------------------------------------------
    // Beats path
    // -----------------------------------------------------------------------

    async fn draft_beats(
        &self,
        run_id: uuid::Uuid,
        outline: &SceneOutline,
        context_block: &str,
        constraints_block: &str,
        opts: &RunOptions,
        stop: &StopToken,
    ) -> Result<(String, usize), DraftError> {
        let scene = outline.scene_number;
        let plan = beats::plan_beats(outline.word_count, self.config.words_per_beat);
        let mut assembled = String::new();

        for part_index in 1..=plan.parts_total {
            if stop.should_stop() {
                return Err(DraftError::Stopped);
            }
            self.events.publish(
                run_id,
                EventType::SceneBeatStart,
                json!({
                    "sceneNum": scene,
                    "partIndex": part_index,
                    "partsTotal": plan.parts_total,
                    "partTargetWords": plan.part_target_words,
                }),
            );

            let mut attempts = 0u32;
            let part = loop {
                attempts += 1;
                let mut vars = scene_vars(outline, context_block, constraints_block);
                vars.insert("part_index".to_string(), part_index.to_string());
                vars.insert("parts_total".to_string(), plan.parts_total.to_string());
                vars.insert(
                    "part_target_words".to_string(),
                    plan.part_target_words.to_string(),
                );
                vars.insert(
                    "beat_position".to_string(),
                    beats::beat_position(part_index, plan.parts_total).to_string(),
                );
                vars.insert(
                    "existing_content".to_string(),
                    tail_words(&assembled, PROMPT_TAIL_WORDS),
                );

                let out = self
                    .runner
                    .run(AgentRole::Writer, "writer_beat", fallback::WRITER_BEAT, &vars, opts)
                    .await?;
                let text = if part_index >= 2 {
                    overlap::strip_overlap(&assembled, &out.content)
                } else {
                    out.content
                };
                let text = overlap::sanitize(&text);

                let generated = count_words(&text);
                if (generated as f64) >= beats::MIN_PART_RATIO * plan.part_target_words as f64 {
                    break text;
                }

                self.events.publish(
                    run_id,
                    EventType::SceneBeatError,
                    json!({
                        "sceneNum": scene,
                        "partIndex": part_index,
                        "partsTotal": plan.parts_total,
                        "reason": "insufficient_words",
                        "wordsGenerated": generated,
                        "wordsRequired": plan.part_target_words,
                    }),
                );
                if attempts >= beats::MAX_PART_ATTEMPTS {
                    return Err(DraftError::BeatInsufficient {
                        scene,
                        part_index,
                        parts_total: plan.parts_total,
                        attempts,
                    });
                }
            };

            if !assembled.is_empty() {
                assembled.push_str("\n\n");
            }
            assembled.push_str(&part);

            self.events.publish(
                run_id,
                EventType::SceneBeatComplete,
                json!({
                    "sceneNum": scene,
                    "partIndex": part_index,
                    "partsTotal": plan.parts_total,
                    "partWordCount": count_words(&part),
                    "totalWordCount": count_words(&assembled),
                }),
            );
        }

        Ok((assembled, plan.parts_total))
    }

    // -----------------------------------------------------------------------
    // Critic / revision / polish calls
    // -----------------------------------------------------------------------

    async fn run_critic(
        &self,
        outline: &SceneOutline,
        content: &str,
        target: usize,
    ) -> Result<Critique, DraftError> {
        let vars = HashMap::from([
            ("scene_number".to_string(), outline.scene_number.to_string()),
            ("title".to_string(), outline.title.clone()),
            ("word_count".to_string(), count_words(content).to_string()),
            ("target_words".to_string(), target.to_string()),
            ("content".to_string(), content.to_string()),
            ("hook".to_string(), outline.hook.clone().unwrap_or_default()),
            ("future_events".to_string(), outline.future_events.join("; ")),
        ]);
        let out = self
            .runner
            .run(
                AgentRole::Critic,
                "critic",
                fallback::CRITIC,
                &vars,
                &RunOptions::default(),
            )
            .await?;

        let value = normalizer::extract_json(&out.content)
            .ok_or_else(|| AgentError::validation(AgentRole::Critic, "critique is not JSON"))?;
        let (critique, _) = normalizer::normalize_critique(value);
        Ok(critique)
    }

    async fn run_revision(
        &self,
        outline: &SceneOutline,
        content: &str,
        critique: &Critique,
        opts: &RunOptions,
    ) -> Result<String, DraftError> {
        let vars = HashMap::from([
            ("scene_number".to_string(), outline.scene_number.to_string()),
            ("title".to_string(), outline.title.clone()),
            ("content".to_string(), content.to_string()),
            (
                "revision_requests".to_string(),
                bullet_list(&critique.revision_requests),
            ),
            ("issues".to_string(), bullet_list(&critique.issues)),
        ]);
        let out = self
            .runner
            .run(AgentRole::Writer, "writer_revise", fallback::WRITER_REVISE, &vars, opts)
            .await?;
        Ok(out.content)
    }

    /// Run polish and validate it. `Ok(Some)` is the accepted polished
    /// content; `Ok(None)` means the polish was rejected and the pre-polish
    /// draft stays canonical.
    async fn polish(
        &self,
        run_id: uuid::Uuid,
        scene: u32,
        outline: &SceneOutline,
        content: &str,
        opts: &RunOptions,
        stop: &StopToken,
    ) -> Result<Option<String>, DraftError> {
        if stop.should_stop() {
            return Err(DraftError::Stopped);
        }
        self.events
            .publish(run_id, EventType::ScenePolishStart, json!({"sceneNum": scene}));

        let vars = HashMap::from([
            ("scene_number".to_string(), scene.to_string()),
            ("title".to_string(), outline.title.clone()),
            ("content".to_string(), content.to_string()),
        ]);
        let out = self
            .runner
            .run(AgentRole::Writer, "writer_polish", fallback::WRITER_POLISH, &vars, opts)
            .await?;
        let polished = overlap::sanitize(&out.content);

        match polish::validate_polish(content, &polished) {
            Ok(()) => Ok(Some(polished)),
            Err(rejection) => {
                warn!(run_id = %run_id, scene, reason = %rejection, "polish rejected, keeping pre-polish draft");
                Ok(None)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    async fn remember_scene(&self, run: &GenerationRun, outline: &SceneOutline, content: &str) {
        let payload = json!({
            "scene_number": outline.scene_number,
            "title": outline.title,
            "content": content,
        });
        if let Err(err) = self
            .vector
            .store(&run.project_id, MemoryKind::Scene, payload)
            .await
        {
            warn!(run_id = %run.run_id, scene = outline.scene_number, error = %err, "failed to index scene");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn scene_vars(
    outline: &SceneOutline,
    context_block: &str,
    constraints_block: &str,
) -> HashMap<String, String> {
    HashMap::from([
        ("scene_number".to_string(), outline.scene_number.to_string()),
        ("title".to_string(), outline.title.clone()),
        (
            "setting".to_string(),
            outline.setting.clone().unwrap_or_default(),
        ),
        ("scene_characters".to_string(), outline.characters.join(", ")),
        ("hook".to_string(), outline.hook.clone().unwrap_or_default()),
        ("target_words".to_string(), outline.word_count.to_string()),
        ("context".to_string(), context_block.to_string()),
        ("constraints".to_string(), constraints_block.to_string()),
    ])
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn tail_words(text: &str, n: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(n);
    words[start..].join(" ")
}

/// Record un-curated observations for the Archivist: one fact per roster
/// character mentioned in the scene.
fn collect_raw_facts(run: &mut GenerationRun, scene: u32, content: &str) {
    let sentences: Vec<&str> = content
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let names: Vec<String> = run.characters.iter().map(|c| c.name.clone()).collect();
    for name in names {
        if let Some(sentence) = sentences.iter().find(|s| s.contains(name.as_str())) {
            let mut fact: String = sentence.chars().take(240).collect();
            if sentence.chars().count() > 240 {
                fact.push('…');
            }
            run.raw_facts.push(RawFact::new(fact, "writer", scene));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
