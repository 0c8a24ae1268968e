//! Uniform agent execution wrapper.
//!
//! Every agent call goes through [`AgentRunner::run`]: compile the prompt
//! (registry override or baked-in fallback), call the LLM client with the
//! role's token ceiling and the run's temperature, classify failures, retry
//! transient ones with bounded exponential backoff, and record execution
//! metrics either way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sf_harness::prompts::PromptStore;
use sf_harness::provider::{classify, FailureKind, LlmClient, LlmError, LlmMessage, LlmRequest, TokenUsage};
use thiserror::Error;
use tracing::{info, warn};

use crate::roles::AgentRole;

const MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AgentError {
    /// The provider failed after exhausting retries (or immediately, for
    /// non-transient kinds).
    #[error("agent {agent} failed ({kind}) after {attempts} attempt(s): {source}")]
    Provider {
        agent: &'static str,
        kind: FailureKind,
        attempts: u32,
        #[source]
        source: LlmError,
    },
    /// The model's output could not be normalized into the expected shape.
    #[error("agent {agent} returned unusable output: {reason}")]
    Validation { agent: &'static str, reason: String },
}

impl AgentError {
    pub fn validation(role: AgentRole, reason: impl Into<String>) -> Self {
        AgentError::Validation {
            agent: role.agent_id(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            AgentError::Provider { kind, .. } => *kind,
            AgentError::Validation { .. } => FailureKind::Validation,
        }
    }
}

// ---------------------------------------------------------------------------
// Options / output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub temperature: f32,
    /// Overrides the role's default ceiling.
    pub max_tokens: Option<u32>,
    /// Per-call deadline; a timeout is classified as `Network` and retried.
    pub deadline: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
            deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub content: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Cumulative execution counters, shared across a runner's clones.
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub total_latency_ms: AtomicU64,
    pub input_tokens: AtomicU64,
    pub output_tokens: AtomicU64,
}

impl RunnerMetrics {
    fn record_success(&self, latency_ms: u64, usage: TokenUsage) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AgentRunner {
    client: Arc<dyn LlmClient>,
    prompts: Arc<dyn PromptStore>,
    model: String,
    backoff_base: Duration,
    metrics: Arc<RunnerMetrics>,
}

impl AgentRunner {
    pub fn new(client: Arc<dyn LlmClient>, prompts: Arc<dyn PromptStore>, model: impl Into<String>) -> Self {
        Self {
            client,
            prompts,
            model: model.into(),
            backoff_base: Duration::from_millis(500),
            metrics: Arc::new(RunnerMetrics::default()),
        }
    }

    /// Shrink the retry backoff (tests).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    /// Execute one agent call.
    ///
    /// JSON response mode is requested iff the compiled prompt literally
    /// contains `"Output as JSON"` or `"Output JSON"`.
    pub async fn run(
        &self,
        role: AgentRole,
        prompt_name: &str,
        fallback: &str,
        vars: &HashMap<String, String>,
        opts: &RunOptions,
    ) -> Result<AgentOutput, AgentError> {
        let compiled = self.prompts.compile(prompt_name, vars, fallback);
        let json_mode = compiled.contains("Output as JSON") || compiled.contains("Output JSON");

        let request = LlmRequest {
            model: self.model.clone(),
            max_tokens: opts.max_tokens.unwrap_or_else(|| role.max_tokens()),
            temperature: opts.temperature,
            json_mode,
        };
        let messages = [LlmMessage::user(compiled)];

        let start = Instant::now();
        let mut attempt = 1u32;
        loop {
            let result = match tokio::time::timeout(
                opts.deadline,
                self.client.complete(&messages, &request),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(LlmError::Timeout),
            };

            match result {
                Ok(response) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    self.metrics.record_success(latency_ms, response.usage);
                    info!(
                        agent = role.agent_id(),
                        prompt = prompt_name,
                        latency_ms,
                        attempts = attempt,
                        success = 1,
                        "agent_execution_success"
                    );
                    return Ok(AgentOutput {
                        content: response.content,
                        usage: response.usage,
                        latency_ms,
                    });
                }
                Err(err) => {
                    let kind = classify(&err);
                    if kind.is_transient() && attempt < MAX_ATTEMPTS {
                        let backoff = self.backoff_base * 2u32.pow(attempt - 1);
                        warn!(
                            agent = role.agent_id(),
                            error_kind = %kind,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            "transient agent failure, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }

                    self.metrics.record_failure();
                    warn!(
                        agent = role.agent_id(),
                        prompt = prompt_name,
                        error_kind = %kind,
                        attempts = attempt,
                        "agent_execution_failure"
                    );
                    return Err(AgentError::Provider {
                        agent: role.agent_id(),
                        kind,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
