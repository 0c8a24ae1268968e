//! The phase state machine and per-run drive task.
//!
//! One tokio task per active run walks the phase graph, checking the run's
//! [`StopToken`] at every safepoint. The task is the sole mutator of its
//! run's state; it works on a cloned copy during long stretches (a whole
//! scene) and syncs back into the shared handle at safepoints, so status
//! queries never wait on an LLM round-trip.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use sf_agents::archivist;
use sf_agents::drafting::{DraftError, SceneDraftingEngine};
use sf_agents::normalizer;
use sf_agents::roles::AgentRole;
use sf_agents::runner::{AgentRunner, RunOptions};
use sf_core::casing::to_snake_keys;
use sf_core::config::EngineConfig;
use sf_core::constraint::{seed_constraints, ConstraintStore};
use sf_core::phase::{Phase, PhaseMachine};
use sf_core::snapshot::{RunSnapshot, SNAPSHOT_ARTIFACT};
use sf_core::types::{
    count_words, Critique, GenerationMode, GenerationRun, LlmSettings, RunStatus,
};
use sf_core::world_state;
use sf_harness::artifact_store::{
    self as artifact_kinds, ArtifactStore, MemoryArtifactStore,
};
use sf_harness::eval_limiter::EvaluationLimiter;
use sf_harness::prompts::{fallback, BuiltinPromptStore, PromptStore};
use sf_harness::provider::{self, LlmClient, LlmError};
use sf_harness::shutdown::{ShutdownSignal, StopToken};
use sf_harness::vector_store::{MemoryKind, MemoryVectorStore, VectorStore};
use sf_stream::{EventLog, EventType};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::registry::{RunHandle, RunRegistry};

type ClientFactory =
    Arc<dyn Fn(&LlmSettings) -> Result<Arc<dyn LlmClient>, LlmError> + Send + Sync>;

/// How many scenes one manuscript revision pass may rewrite.
const MANUSCRIPT_REVISION_SCENES: usize = 2;

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    registry: RunRegistry,
    events: EventLog,
    prompts: Arc<dyn PromptStore>,
    vector: Arc<dyn VectorStore>,
    artifacts: Arc<dyn ArtifactStore>,
    shutdown: ShutdownSignal,
    config: EngineConfig,
    clients: ClientFactory,
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: RunRegistry::new(),
            events: EventLog::new(),
            prompts: Arc::new(BuiltinPromptStore::new(config.prompt_cache_ttl())),
            vector: Arc::new(MemoryVectorStore::new()),
            artifacts: Arc::new(MemoryArtifactStore::new()),
            shutdown: ShutdownSignal::new(),
            config,
            clients: Arc::new(|settings| provider::client_for(settings)),
        }
    }

    /// Swap the provider factory (tests inject a mock client here).
    pub fn with_client_factory(mut self, clients: ClientFactory) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_vector_store(mut self, vector: Arc<dyn VectorStore>) -> Self {
        self.vector = vector;
        self
    }

    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_prompt_store(mut self, prompts: Arc<dyn PromptStore>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        self.artifacts.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Ingress operations
    // -----------------------------------------------------------------------

    /// Create a run, persist its initial state, and spawn its drive task.
    pub async fn start_generation(
        self: &Arc<Self>,
        project_id: &str,
        seed_idea: &str,
        llm: LlmSettings,
        mode: GenerationMode,
    ) -> Result<Uuid, EngineError> {
        if project_id.trim().is_empty() {
            return Err(EngineError::BadRequest("projectId is required".into()));
        }
        if seed_idea.trim().is_empty() {
            return Err(EngineError::BadRequest("seedIdea is required".into()));
        }

        let run = GenerationRun::new(project_id, seed_idea, llm, mode);
        let run_id = run.run_id;

        let snapshot = serde_json::to_value(RunSnapshot::from_run(&run))
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        self.artifacts.save(run_id, SNAPSHOT_ARTIFACT, snapshot).await?;

        let token = StopToken::new(self.shutdown.clone());
        let handle = Arc::new(RunHandle::new(run, token));
        self.registry.insert(run_id, handle.clone());

        self.events.publish(
            run_id,
            EventType::GenerationStarted,
            json!({"projectId": project_id, "mode": mode, "phase": Phase::Genesis.as_str()}),
        );
        info!(run_id = %run_id, project_id, "generation started");

        self.spawn_drive(handle);
        Ok(run_id)
    }

    pub async fn get_status(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        match self.registry.get(run_id) {
            Some(handle) => Ok(handle.status().await),
            None => Err(EngineError::UnknownRun(run_id)),
        }
    }

    pub async fn list_runs(&self) -> Vec<RunStatus> {
        self.registry.statuses().await
    }

    /// Pause flips the flag; the run task exits at its next safepoint.
    pub async fn pause(&self, run_id: Uuid) -> Result<(), EngineError> {
        let handle = self
            .registry
            .get(run_id)
            .ok_or(EngineError::UnknownRun(run_id))?;
        handle.token.set_paused(true);
        let mut run = handle.run.write().await;
        run.is_paused = true;
        run.touch();
        info!(run_id = %run_id, "run paused");
        Ok(())
    }

    /// Resume clears the flag and re-spawns the drive task, which picks up
    /// idempotently at the current phase and scene.
    pub async fn resume(self: &Arc<Self>, run_id: Uuid) -> Result<(), EngineError> {
        let handle = self
            .registry
            .get(run_id)
            .ok_or(EngineError::UnknownRun(run_id))?;
        {
            let mut run = handle.run.write().await;
            if run.is_completed {
                return Err(EngineError::InvalidState("run already completed".into()));
            }
            run.is_paused = false;
            run.touch();
        }
        handle.token.set_paused(false);
        if !handle.is_running() {
            self.spawn_drive(handle);
        }
        info!(run_id = %run_id, "run resumed");
        Ok(())
    }

    /// Cancel is final: the run is evicted and emits nothing further.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let handle = self
            .registry
            .get(run_id)
            .ok_or(EngineError::UnknownRun(run_id))?;
        handle.token.cancel();
        {
            let mut run = handle.run.write().await;
            run.error = Some("cancelled".into());
            run.touch();
        }
        self.registry.remove(run_id);
        info!(run_id = %run_id, "run cancelled and evicted");
        Ok(())
    }

    /// Evict completed runs whose last update is older than `ttl`. Their
    /// event logs and artifacts stay readable; only the registry entry
    /// goes.
    pub async fn evict_completed(&self, ttl: std::time::Duration) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut evicted = 0usize;
        for handle in self.registry.handles() {
            let status = handle.status().await;
            if status.is_completed && status.updated_at <= cutoff {
                self.registry.remove(status.run_id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "completed runs evicted from the registry");
        }
        evicted
    }

    // -----------------------------------------------------------------------
    // Shutdown / restore
    // -----------------------------------------------------------------------

    /// Graceful shutdown: signal every run task, wait a bounded time for
    /// them to park, then snapshot whatever state exists. Still in-flight
    /// LLM calls are abandoned.
    pub async fn shutdown_gracefully(&self) {
        let active: Vec<_> = self
            .registry
            .handles()
            .into_iter()
            .filter(|handle| handle.is_running())
            .collect();

        for handle in &active {
            let status = handle.status().await;
            self.events.publish(
                status.run_id,
                EventType::ShutdownInitiated,
                json!({"phase": status.phase.as_str(), "currentScene": status.current_scene}),
            );
        }

        let mut signal = self.shutdown.clone();
        self.shutdown.trigger();
        if !active.is_empty() {
            signal
                .wait_for_park(active.len(), self.config.graceful_shutdown())
                .await;
        }

        for handle in self.registry.handles() {
            let run = handle.run.read().await.clone();
            if run.is_completed {
                continue;
            }
            let snapshot = RunSnapshot::from_run(&run);
            match serde_json::to_value(&snapshot) {
                Ok(body) => {
                    if let Err(err) = self.artifacts.save(run.run_id, SNAPSHOT_ARTIFACT, body).await {
                        error!(run_id = %run.run_id, error = %err, "failed to persist shutdown snapshot");
                    }
                }
                Err(err) => error!(run_id = %run.run_id, error = %err, "failed to serialize snapshot"),
            }
        }
        info!(runs = self.registry.len(), "shutdown snapshots written");
    }

    /// Load every interrupted snapshot into the registry, paused, awaiting
    /// an explicit resume.
    pub async fn restore_all(&self) -> Result<usize, EngineError> {
        let snapshots = self.artifacts.list_kind(SNAPSHOT_ARTIFACT).await?;
        let mut restored = 0usize;
        for (run_id, body) in snapshots {
            let snapshot: RunSnapshot = match serde_json::from_value(body) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "unreadable snapshot, skipping");
                    continue;
                }
            };
            if snapshot.is_completed {
                continue;
            }
            let mut run = snapshot.into_run();
            run.is_paused = true;

            let token = StopToken::new(self.shutdown.clone());
            token.set_paused(true);
            let status = run.status();
            self.registry.insert(run_id, Arc::new(RunHandle::new(run, token)));
            self.events.publish(
                run_id,
                EventType::RunRestored,
                json!({"phase": status.phase.as_str(), "currentScene": status.current_scene}),
            );
            restored += 1;
        }
        info!(restored, "interrupted runs restored (paused)");
        Ok(restored)
    }

    // -----------------------------------------------------------------------
    // Drive task
    // -----------------------------------------------------------------------

    fn spawn_drive(self: &Arc<Self>, handle: Arc<RunHandle>) {
        let this = self.clone();
        handle.set_running(true);
        tokio::spawn(async move {
            let result = this.drive(&handle).await;
            if let Err(err) = result {
                this.handle_error(&handle, err).await;
            }
            handle.set_running(false);
            if this.shutdown.is_shutting_down() {
                this.shutdown.confirm_parked();
            }
        });
    }

    async fn drive(self: &Arc<Self>, handle: &Arc<RunHandle>) -> Result<(), EngineError> {
        let settings = handle.run.read().await.llm.clone();
        let client = (self.clients)(&settings)?;
        let runner = AgentRunner::new(client, self.prompts.clone(), settings.model.clone());
        // Evaluation concurrency is capped per run.
        let evals = EvaluationLimiter::new(self.config.evaluation_concurrency);
        let engine = SceneDraftingEngine::new(
            runner.clone(),
            self.vector.clone(),
            self.events.clone(),
            evals,
            self.config.clone(),
        );
        let mut manuscript_revisions = 0u32;

        loop {
            // Safepoint between phases.
            if handle.token.is_cancelled() {
                return Ok(());
            }
            if handle.token.is_paused() || self.shutdown.is_shutting_down() {
                let run_id = handle.status().await.run_id;
                info!(run_id = %run_id, "run parked at phase boundary");
                return Ok(());
            }

            let phase = handle.run.read().await.phase;
            match phase {
                Phase::Genesis => {
                    self.run_genesis(handle, &runner).await?;
                    self.advance(handle).await?;
                }
                Phase::Characters => {
                    self.run_characters(handle, &runner).await?;
                    self.advance(handle).await?;
                }
                Phase::NarratorDesign => {
                    self.run_narrator_design(handle, &runner).await?;
                    self.advance(handle).await?;
                }
                Phase::Worldbuilding => {
                    self.run_worldbuilding(handle, &runner).await?;
                    self.advance(handle).await?;
                }
                Phase::Outlining => {
                    self.run_outlining(handle, &runner).await?;
                    self.advance(handle).await?;
                }
                Phase::AdvancedPlanning => {
                    self.run_advanced_planning(handle, &runner).await?;
                    self.advance(handle).await?;
                }
                Phase::Drafting => {
                    if !self.run_drafting(handle, &engine, &runner).await? {
                        // Parked mid-drafting.
                        return Ok(());
                    }
                    self.advance(handle).await?;
                }
                Phase::Critique => {
                    let revision_needed = self.run_manuscript_critique(handle, &runner).await?;
                    let next = {
                        let mut run = handle.run.write().await;
                        let mut machine = PhaseMachine::at(run.phase);
                        let next = machine
                            .resolve_critique(
                                revision_needed,
                                manuscript_revisions,
                                self.config.max_revisions,
                            )
                            .map_err(|e| EngineError::Internal(e.to_string()))?;
                        run.phase = next;
                        run.touch();
                        next
                    };
                    info!(next = %next, "manuscript critique resolved");
                }
                Phase::Revision => {
                    self.run_manuscript_revision(handle, &runner).await?;
                    manuscript_revisions += 1;
                    self.advance(handle).await?;
                }
                Phase::OriginalityCheck => {
                    self.run_report_phase(
                        handle,
                        &runner,
                        AgentRole::Originality,
                        "originality",
                        fallback::ORIGINALITY,
                        "originality_report",
                    )
                    .await?;
                    self.advance(handle).await?;
                }
                Phase::ImpactAssessment => {
                    self.run_report_phase(
                        handle,
                        &runner,
                        AgentRole::Impact,
                        "impact",
                        fallback::IMPACT,
                        "impact_report",
                    )
                    .await?;
                    self.advance(handle).await?;
                }
                Phase::Polish => {
                    // run_final_polish advances to Complete itself.
                    self.run_final_polish(handle).await?;
                }
                Phase::Complete => return Ok(()),
            }
        }
    }

    async fn advance(&self, handle: &Arc<RunHandle>) -> Result<(), EngineError> {
        let (run_id, snapshot) = {
            let mut run = handle.run.write().await;
            let mut machine = PhaseMachine::at(run.phase);
            let next = machine
                .advance()
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            run.phase = next;
            run.touch();
            (run.run_id, RunSnapshot::from_run(&run))
        };
        // Phase boundaries double as the periodic snapshot points.
        if let Ok(body) = serde_json::to_value(snapshot) {
            self.artifacts.save(run_id, SNAPSHOT_ARTIFACT, body).await?;
        }
        Ok(())
    }

    /// Route a failure: set the run's error, emit the legacy
    /// `generation_error`, then the terminal structured `ERROR`, and close
    /// the trace as failed.
    async fn handle_error(&self, handle: &Arc<RunHandle>, err: EngineError) {
        if matches!(err, EngineError::Draft(DraftError::Stopped)) {
            // Parking is not a failure.
            return;
        }
        let status = {
            let mut run = handle.run.write().await;
            run.error = Some(err.to_string());
            run.touch();
            run.status()
        };

        error!(
            run_id = %status.run_id,
            phase = %status.phase,
            error = %err,
            kind = err.kind_label(),
            success = 0,
            "run failed"
        );

        self.events.publish(
            status.run_id,
            EventType::GenerationError,
            json!({"error": err.to_string()}),
        );
        self.events.publish(
            status.run_id,
            EventType::Error,
            json!({
                "error": err.to_string(),
                "kind": err.kind_label(),
                "phase": status.phase.as_str(),
                "currentScene": status.current_scene,
                "totalScenes": status.total_scenes,
                "recoverable": false,
                "timestamp": chrono::Utc::now(),
            }),
        );
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    fn publish_phase_start(&self, run_id: Uuid, phase: Phase) {
        self.events
            .publish(run_id, EventType::PhaseStart, json!({"phase": phase.as_str()}));
    }

    fn publish_phase_complete(&self, run_id: Uuid, phase: Phase, artifact: Value) {
        self.events.publish(
            run_id,
            EventType::PhaseComplete,
            json!({"phase": phase.as_str(), "artifact": artifact}),
        );
    }

    async fn run_genesis(
        &self,
        handle: &Arc<RunHandle>,
        runner: &AgentRunner,
    ) -> Result<(), EngineError> {
        let (run_id, seed_idea, opts) = {
            let run = handle.run.read().await;
            (run.run_id, run.seed_idea.clone(), run_opts(&run))
        };
        self.publish_phase_start(run_id, Phase::Genesis);

        let vars = HashMap::from([("seed_idea".to_string(), seed_idea.clone())]);
        let out = runner
            .run(AgentRole::Architect, "architect", fallback::ARCHITECT, &vars, &opts)
            .await?;
        let value = normalizer::extract_json(&out.content).ok_or_else(|| EngineError::Validation {
            phase: "genesis".into(),
            reason: "architect output was not JSON".into(),
        })?;
        let narrative = normalizer::normalize_narrative(value);
        if narrative.premise.trim().is_empty() {
            return Err(EngineError::Validation {
                phase: "genesis".into(),
                reason: "narrative has no premise".into(),
            });
        }

        // Seed constraints are installed before any other phase runs.
        {
            let mut run = handle.run.write().await;
            run.narrative = Some(narrative.clone());
            let seeds = seed_constraints(&seed_idea, &narrative);
            run.constraints.add_seed(seeds);
            run.touch();
        }

        let artifact = serde_json::to_value(&narrative).unwrap_or_default();
        self.artifacts
            .save(run_id, artifact_kinds::KIND_NARRATIVE, to_snake_keys(&artifact))
            .await?;
        self.publish_phase_complete(run_id, Phase::Genesis, artifact);
        Ok(())
    }

    async fn run_characters(
        &self,
        handle: &Arc<RunHandle>,
        runner: &AgentRunner,
    ) -> Result<(), EngineError> {
        let (run_id, project_id, narrative, opts) = {
            let run = handle.run.read().await;
            (
                run.run_id,
                run.project_id.clone(),
                run.narrative.clone().unwrap_or_default(),
                run_opts(&run),
            )
        };
        self.publish_phase_start(run_id, Phase::Characters);

        let vars = HashMap::from([
            ("premise".to_string(), narrative.premise.clone()),
            ("genre".to_string(), narrative.genre.clone()),
            ("tone".to_string(), narrative.tone.clone()),
        ]);
        let out = runner
            .run(AgentRole::Profiler, "profiler", fallback::PROFILER, &vars, &opts)
            .await?;
        let value = normalizer::extract_json(&out.content).ok_or_else(|| EngineError::Validation {
            phase: "characters".into(),
            reason: "profiler output was not JSON".into(),
        })?;
        let characters = normalizer::normalize_characters(value);
        if characters.is_empty() {
            return Err(EngineError::Validation {
                phase: "characters".into(),
                reason: "no usable character records".into(),
            });
        }

        {
            let mut run = handle.run.write().await;
            run.world_state = world_state::initial_from_characters(&characters);
            run.characters = characters.clone();
            run.touch();
        }

        for character in &characters {
            self.artifacts
                .upsert_character(&project_id, run_id, character)
                .await?;
            let payload = serde_json::to_value(character).unwrap_or_default();
            if let Err(err) = self
                .vector
                .store(&project_id, MemoryKind::Character, payload)
                .await
            {
                warn!(run_id = %run_id, error = %err, "failed to index character");
            }
        }
        let artifact = serde_json::to_value(&characters).unwrap_or_default();
        self.artifacts
            .save(run_id, artifact_kinds::KIND_CHARACTERS, to_snake_keys(&artifact))
            .await?;
        self.publish_phase_complete(run_id, Phase::Characters, artifact);
        Ok(())
    }

    async fn run_narrator_design(
        &self,
        handle: &Arc<RunHandle>,
        runner: &AgentRunner,
    ) -> Result<(), EngineError> {
        let (run_id, narrative, characters_text, opts) = {
            let run = handle.run.read().await;
            (
                run.run_id,
                run.narrative.clone().unwrap_or_default(),
                characters_block(&run),
                run_opts(&run),
            )
        };
        self.publish_phase_start(run_id, Phase::NarratorDesign);

        let vars = HashMap::from([
            ("premise".to_string(), narrative.premise.clone()),
            ("tone".to_string(), narrative.tone.clone()),
            ("characters".to_string(), characters_text),
        ]);
        let out = runner
            .run(AgentRole::Profiler, "narrator", fallback::NARRATOR, &vars, &opts)
            .await?;
        let design = normalizer::extract_json(&out.content)
            .unwrap_or_else(|| json!({"style_notes": out.content}));

        // The narrator design rides with the narrative artifact.
        let mut artifact = serde_json::to_value(&narrative).unwrap_or_default();
        artifact["narrator"] = design.clone();
        self.artifacts
            .save(run_id, artifact_kinds::KIND_NARRATIVE, to_snake_keys(&artifact))
            .await?;
        self.publish_phase_complete(run_id, Phase::NarratorDesign, design);
        Ok(())
    }

    async fn run_worldbuilding(
        &self,
        handle: &Arc<RunHandle>,
        runner: &AgentRunner,
    ) -> Result<(), EngineError> {
        let (run_id, project_id, narrative, characters_text, opts) = {
            let run = handle.run.read().await;
            (
                run.run_id,
                run.project_id.clone(),
                run.narrative.clone().unwrap_or_default(),
                characters_block(&run),
                run_opts(&run),
            )
        };
        self.publish_phase_start(run_id, Phase::Worldbuilding);

        let vars = HashMap::from([
            ("premise".to_string(), narrative.premise.clone()),
            ("genre".to_string(), narrative.genre.clone()),
            ("characters".to_string(), characters_text),
        ]);
        let out = runner
            .run(
                AgentRole::Worldbuilder,
                "worldbuilder",
                fallback::WORLDBUILDER,
                &vars,
                &opts,
            )
            .await?;
        let value = normalizer::extract_json(&out.content).ok_or_else(|| EngineError::Validation {
            phase: "worldbuilding".into(),
            reason: "worldbuilder output was not JSON".into(),
        })?;
        let worldbuilding = normalizer::normalize_worldbuilding(value);

        {
            let mut run = handle.run.write().await;
            run.worldbuilding = worldbuilding.clone();
            run.touch();
        }

        for (kind, element) in &worldbuilding {
            let mut payload = serde_json::to_value(element).unwrap_or_default();
            payload["element_type"] = Value::String(kind.clone());
            if let Err(err) = self
                .vector
                .store(&project_id, MemoryKind::WorldElement, payload)
                .await
            {
                warn!(run_id = %run_id, error = %err, "failed to index world element");
            }
        }
        let artifact = serde_json::to_value(&worldbuilding).unwrap_or_default();
        self.artifacts
            .save(run_id, artifact_kinds::KIND_WORLDBUILDING, to_snake_keys(&artifact))
            .await?;
        self.publish_phase_complete(run_id, Phase::Worldbuilding, artifact);
        Ok(())
    }

    async fn run_outlining(
        &self,
        handle: &Arc<RunHandle>,
        runner: &AgentRunner,
    ) -> Result<(), EngineError> {
        let (run_id, narrative, characters_text, constraints_text, opts) = {
            let run = handle.run.read().await;
            (
                run.run_id,
                run.narrative.clone().unwrap_or_default(),
                characters_block(&run),
                ConstraintStore::render_block(&run.constraints.snapshot()),
                run_opts(&run),
            )
        };
        self.publish_phase_start(run_id, Phase::Outlining);

        let vars = HashMap::from([
            ("premise".to_string(), narrative.premise.clone()),
            ("arc".to_string(), narrative.arc.clone()),
            ("characters".to_string(), characters_text),
            ("constraints".to_string(), constraints_text),
        ]);
        let out = runner
            .run(
                AgentRole::Strategist,
                "strategist_outline",
                fallback::STRATEGIST_OUTLINE,
                &vars,
                &opts,
            )
            .await?;
        let value = normalizer::extract_json(&out.content).ok_or_else(|| EngineError::Validation {
            phase: "outlining".into(),
            reason: "strategist output was not JSON".into(),
        })?;
        let outline = normalizer::normalize_outline(value);
        if outline.scenes.is_empty() {
            return Err(EngineError::Validation {
                phase: "outlining".into(),
                reason: "outline has no scenes".into(),
            });
        }

        {
            let mut run = handle.run.write().await;
            run.total_scenes = outline.scenes.len() as u32;
            run.outline = Some(outline.clone());
            run.touch();
        }

        let artifact = serde_json::to_value(&outline).unwrap_or_default();
        self.artifacts
            .save(run_id, artifact_kinds::KIND_OUTLINE, to_snake_keys(&artifact))
            .await?;
        self.publish_phase_complete(run_id, Phase::Outlining, artifact);
        Ok(())
    }

    async fn run_advanced_planning(
        &self,
        handle: &Arc<RunHandle>,
        runner: &AgentRunner,
    ) -> Result<(), EngineError> {
        let (run_id, outline_text, constraints_text, opts) = {
            let run = handle.run.read().await;
            let outline_text = run
                .outline
                .as_ref()
                .map(|outline| {
                    outline
                        .scenes
                        .iter()
                        .map(|s| format!("{}. {} ({} words)", s.scene_number, s.title, s.word_count))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            (
                run.run_id,
                outline_text,
                ConstraintStore::render_block(&run.constraints.snapshot()),
                run_opts(&run),
            )
        };
        self.publish_phase_start(run_id, Phase::AdvancedPlanning);

        let vars = HashMap::from([
            ("outline".to_string(), outline_text),
            ("constraints".to_string(), constraints_text),
        ]);
        let out = runner
            .run(
                AgentRole::Strategist,
                "strategist_plan",
                fallback::STRATEGIST_PLAN,
                &vars,
                &opts,
            )
            .await?;
        let plan = normalizer::extract_json(&out.content)
            .unwrap_or_else(|| json!({"continuity_notes": out.content}));

        self.artifacts
            .save(run_id, artifact_kinds::KIND_ADVANCED_PLAN, to_snake_keys(&plan))
            .await?;
        self.publish_phase_complete(run_id, Phase::AdvancedPlanning, plan);
        Ok(())
    }

    /// The per-scene loop. Returns `false` when parked mid-phase.
    async fn run_drafting(
        &self,
        handle: &Arc<RunHandle>,
        engine: &SceneDraftingEngine,
        runner: &AgentRunner,
    ) -> Result<bool, EngineError> {
        let (run_id, project_id, outline) = {
            let run = handle.run.read().await;
            let outline = run
                .outline
                .clone()
                .ok_or_else(|| EngineError::InvalidState("drafting without an outline".into()))?;
            (run.run_id, run.project_id.clone(), outline)
        };
        self.publish_phase_start(run_id, Phase::Drafting);

        for scene_outline in &outline.scenes {
            let scene = scene_outline.scene_number;

            // Idempotent resume: finalized scenes are skipped without
            // re-emitting their events.
            let already_done = {
                let run = handle.run.read().await;
                run.drafts
                    .get(&scene)
                    .map(|draft| draft.status.is_terminal())
                    .unwrap_or(false)
            };
            if already_done {
                continue;
            }

            // Safepoint between scenes.
            if handle.token.should_stop() {
                return Ok(false);
            }

            let mut working = {
                let mut run = handle.run.write().await;
                run.current_scene = scene;
                run.current_scene_outline = Some(scene_outline.clone());
                run.touch();
                run.clone()
            };

            let scene_result = engine.draft_scene(&mut working, scene_outline, &handle.token).await;
            *handle.run.write().await = working;

            let result = match scene_result {
                Ok(result) => result,
                Err(DraftError::Stopped) => return Ok(false),
                Err(err) => return Err(err.into()),
            };

            self.persist_scene(handle, &project_id, scene, result.expansion_rounds > 0)
                .await?;

            // Archivist cadence.
            if scene % self.config.archivist_cadence == 0 {
                self.archivist_pass(handle, runner, scene).await;
            }
        }

        // One closing pass so the fact log never ends with an unconsumed
        // suffix.
        let (last_archived, total) = {
            let run = handle.run.read().await;
            (run.last_archivist_scene, run.total_scenes)
        };
        if last_archived < total {
            self.archivist_pass(handle, runner, total).await;
        }

        let drafted = handle.run.read().await.drafts.len();
        self.publish_phase_complete(
            run_id,
            Phase::Drafting,
            json!({"scenes": total, "drafted": drafted}),
        );
        Ok(true)
    }

    /// Archivist failures never kill a run; they degrade to a logged skip.
    async fn archivist_pass(&self, handle: &Arc<RunHandle>, runner: &AgentRunner, up_to: u32) {
        let mut working = handle.run.read().await.clone();
        match archivist::run_pass(runner, &self.events, &mut working, up_to).await {
            Ok(outcome) => {
                *handle.run.write().await = working;
                let run_id = handle.status().await.run_id;
                info!(
                    run_id = %run_id,
                    up_to,
                    constraints = outcome.constraint_count,
                    "archivist pass applied"
                );
            }
            Err(err) => {
                warn!(up_to, error = %err, "archivist pass failed, continuing without");
            }
        }
    }

    async fn persist_scene(
        &self,
        handle: &Arc<RunHandle>,
        project_id: &str,
        scene: u32,
        expanded: bool,
    ) -> Result<(), EngineError> {
        let run = handle.run.read().await;
        let run_id = run.run_id;
        let Some(draft) = run.drafts.get(&scene) else {
            return Ok(());
        };
        self.artifacts.upsert_draft(project_id, run_id, scene, draft).await?;
        if let Some(critique) = run.critiques.get(&scene).and_then(|c| c.last()) {
            self.artifacts
                .upsert_critique(project_id, run_id, scene, critique)
                .await?;
        }
        let body = to_snake_keys(&serde_json::to_value(draft).unwrap_or_default());
        if expanded {
            self.artifacts
                .save(run_id, &artifact_kinds::expanded_scene_kind(scene), body.clone())
                .await?;
        }
        if run.revisions_for(scene) > 0 {
            self.artifacts
                .save(run_id, &artifact_kinds::revision_scene_kind(scene), body.clone())
                .await?;
        }
        if draft.status.is_terminal() {
            self.artifacts
                .save(run_id, &artifact_kinds::final_scene_kind(scene), body)
                .await?;
        }
        let snapshot = RunSnapshot::from_run(&run);
        drop(run);
        if let Ok(body) = serde_json::to_value(snapshot) {
            self.artifacts.save(run_id, SNAPSHOT_ARTIFACT, body).await?;
        }
        Ok(())
    }

    /// Manuscript-level critique. Returns whether a revision pass is
    /// needed.
    async fn run_manuscript_critique(
        &self,
        handle: &Arc<RunHandle>,
        runner: &AgentRunner,
    ) -> Result<bool, EngineError> {
        let (run_id, summary, opts) = {
            let run = handle.run.read().await;
            (run.run_id, manuscript_summary(&run), run_opts(&run))
        };
        self.publish_phase_start(run_id, Phase::Critique);

        let vars = HashMap::from([("summary".to_string(), summary)]);
        let out = runner
            .run(
                AgentRole::Critic,
                "manuscript_critic",
                fallback::MANUSCRIPT_CRITIC,
                &vars,
                &opts,
            )
            .await?;
        let value = normalizer::extract_json(&out.content).ok_or_else(|| EngineError::Validation {
            phase: "critique".into(),
            reason: "manuscript critique was not JSON".into(),
        })?;
        let (critique, wire) = normalizer::normalize_critique(value);

        let approved = critique.revision_needed == Some(false)
            || critique.approved == Some(true)
            || critique.score >= 8.0;

        self.artifacts
            .save(run_id, "manuscript_critique", to_snake_keys(&wire))
            .await?;
        self.publish_phase_complete(run_id, Phase::Critique, wire);
        Ok(!approved)
    }

    /// Manuscript revision: rewrite the weakest scenes (lowest last
    /// critique score, capped) against the manuscript critique's requests.
    async fn run_manuscript_revision(
        &self,
        handle: &Arc<RunHandle>,
        runner: &AgentRunner,
    ) -> Result<(), EngineError> {
        let (run_id, project_id, targets, requests, opts) = {
            let run = handle.run.read().await;
            let mut scored: Vec<(u32, f64)> = run
                .critiques
                .iter()
                .filter_map(|(scene, critiques)| {
                    last_critique_score(critiques).map(|score| (*scene, score))
                })
                .filter(|(_, score)| *score < 8.0)
                .collect();
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let targets: Vec<u32> = scored
                .into_iter()
                .take(MANUSCRIPT_REVISION_SCENES)
                .map(|(scene, _)| scene)
                .collect();
            let requests = run
                .critiques
                .values()
                .filter_map(|c| c.last())
                .flat_map(|c| c.revision_requests.clone())
                .collect::<Vec<_>>()
                .join("\n- ");
            (run.run_id, run.project_id.clone(), targets, requests, run_opts(&run))
        };
        self.publish_phase_start(run_id, Phase::Revision);

        for scene in &targets {
            let (title, content) = {
                let run = handle.run.read().await;
                match run.drafts.get(scene) {
                    Some(draft) => (draft.title.clone(), draft.content.clone()),
                    None => continue,
                }
            };
            self.events
                .publish(run_id, EventType::SceneRevisionStart, json!({"sceneNum": scene}));

            let vars = HashMap::from([
                ("scene_number".to_string(), scene.to_string()),
                ("title".to_string(), title),
                ("content".to_string(), content),
                ("revision_requests".to_string(), format!("- {requests}")),
                ("issues".to_string(), "(see revision requests)".to_string()),
            ]);
            let out = runner
                .run(AgentRole::Writer, "writer_revise", fallback::WRITER_REVISE, &vars, &opts)
                .await?;

            {
                let mut run = handle.run.write().await;
                if let Some(draft) = run.drafts.get_mut(scene) {
                    if !out.content.trim().is_empty() {
                        draft.set_content(out.content.clone());
                        draft.revision_number += 1;
                    }
                }
                run.touch();
            }
            self.persist_scene(handle, &project_id, *scene, false).await?;
            self.events
                .publish(run_id, EventType::SceneRevisionComplete, json!({"sceneNum": scene}));
        }

        self.publish_phase_complete(
            run_id,
            Phase::Revision,
            json!({"revisedScenes": targets}),
        );
        Ok(())
    }

    /// Originality check and impact assessment share a shape: agent over
    /// the manuscript summary, report saved as an artifact.
    async fn run_report_phase(
        &self,
        handle: &Arc<RunHandle>,
        runner: &AgentRunner,
        role: AgentRole,
        prompt_name: &str,
        prompt_fallback: &str,
        artifact_kind: &str,
    ) -> Result<(), EngineError> {
        let (run_id, phase, summary, opts) = {
            let run = handle.run.read().await;
            (run.run_id, run.phase, manuscript_summary(&run), run_opts(&run))
        };
        self.publish_phase_start(run_id, phase);

        let vars = HashMap::from([("summary".to_string(), summary)]);
        let out = runner.run(role, prompt_name, prompt_fallback, &vars, &opts).await?;
        let report =
            normalizer::extract_json(&out.content).unwrap_or_else(|| json!({"notes": out.content}));

        self.artifacts
            .save(run_id, artifact_kind, to_snake_keys(&report))
            .await?;
        self.publish_phase_complete(run_id, phase, report);
        Ok(())
    }

    /// Terminal phase: the per-scene drafts are already polished; this pass
    /// seals them as final artifacts and completes the run.
    async fn run_final_polish(&self, handle: &Arc<RunHandle>) -> Result<(), EngineError> {
        let (run_id, drafts, total_scenes) = {
            let run = handle.run.read().await;
            (run.run_id, run.drafts.clone(), run.total_scenes)
        };
        self.publish_phase_start(run_id, Phase::Polish);

        let mut total_words = 0usize;
        for (scene, draft) in &drafts {
            total_words += count_words(&draft.content);
            let body = to_snake_keys(&serde_json::to_value(draft).unwrap_or_default());
            self.artifacts
                .save(run_id, &artifact_kinds::final_scene_kind(*scene), body)
                .await?;
        }

        {
            let mut run = handle.run.write().await;
            run.is_completed = true;
            run.phase = Phase::Complete;
            run.touch();
        }
        self.publish_phase_complete(
            run_id,
            Phase::Polish,
            json!({"totalScenes": total_scenes, "totalWords": total_words}),
        );
        self.events.publish(
            run_id,
            EventType::GenerationCompleted,
            json!({"totalScenes": total_scenes}),
        );
        info!(run_id = %run_id, total_scenes, "generation completed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run_opts(run: &GenerationRun) -> RunOptions {
    RunOptions {
        temperature: run.llm.temperature,
        ..RunOptions::default()
    }
}

fn characters_block(run: &GenerationRun) -> String {
    run.characters
        .iter()
        .map(|c| {
            format!(
                "- {} ({}): {}",
                c.name,
                c.role,
                c.description.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn manuscript_summary(run: &GenerationRun) -> String {
    let mut out = String::new();
    if let Some(narrative) = &run.narrative {
        out.push_str(&format!(
            "Premise: {}\nGenre: {}\nArc: {}\n\n",
            narrative.premise, narrative.genre, narrative.arc
        ));
    }
    for (scene, draft) in &run.drafts {
        let score = run
            .critiques
            .get(scene)
            .and_then(|c| c.last())
            .map(|c| format!("{:.1}", c.score))
            .unwrap_or_else(|| "-".into());
        out.push_str(&format!(
            "Scene {}: {} ({} words, status {}, score {})\n",
            scene,
            draft.title,
            draft.word_count,
            draft.status.as_str(),
            score
        ));
        let opening: String = draft.content.split_whitespace().take(40).collect::<Vec<_>>().join(" ");
        out.push_str(&format!("  opens: {opening}…\n"));
    }
    out
}

fn last_critique_score(critiques: &[Critique]) -> Option<f64> {
    critiques.last().map(|c| c.score)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
