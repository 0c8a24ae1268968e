//! Transport-agnostic ingress facade.
//!
//! Every operation a client can perform, independent of the HTTP/WebSocket
//! wiring that fronts it in production. Requests pass the rate-limit gate
//! before touching the orchestrator; the event stream is handed out as a
//! frame channel implementing the connect/replay/tail/heartbeat protocol.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sf_core::types::{GenerationMode, LlmSettings, RunStatus};
use sf_harness::rate_limiter::{GateError, Identity, RateLimitGate};
use sf_stream::{subscriber, StreamFrame};
use thiserror::Error;
use uuid::Uuid;

use crate::error::EngineError;
use crate::orchestrator::Orchestrator;

/// Path prefix that selects the expensive rate tier.
pub const GENERATE_PATH: &str = "/api/generate";

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited – retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    /// The rate-limit store is down; fail secure.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("run not found: {0}")]
    NotFound(Uuid),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// The HTTP status the transport layer should map this to.
    pub fn http_status(&self) -> u16 {
        match self {
            ApiError::RateLimited { .. } => 429,
            ApiError::Unavailable(_) => 503,
            ApiError::NotFound(_) => 404,
            ApiError::BadRequest(_) => 400,
            ApiError::Conflict(_) => 409,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::RateLimited {
                retry_after_secs, ..
            } => ApiError::RateLimited { retry_after_secs },
            GateError::Unavailable(reason) => ApiError::Unavailable(reason),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownRun(id) => ApiError::NotFound(id),
            EngineError::BadRequest(reason) => ApiError::BadRequest(reason),
            EngineError::InvalidState(reason) => ApiError::Conflict(reason),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

/// Who is calling, as resolved by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub bearer_subject: Option<String>,
    pub api_key: Option<String>,
    pub client_ip: Option<String>,
}

impl Caller {
    fn identity(&self) -> Identity {
        Identity::resolve(
            self.bearer_subject.as_deref(),
            self.api_key.as_deref(),
            self.client_ip.as_deref(),
        )
    }
}

/// StartGeneration body. Accepts both camelCase and snake_case spellings
/// for back-compat with older clients.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    #[serde(alias = "projectId")]
    pub project_id: String,
    #[serde(alias = "seedIdea")]
    pub seed_idea: String,
    #[serde(alias = "llmConfig", alias = "llm_config", default)]
    pub llm: LlmSettings,
    #[serde(alias = "generation_mode", alias = "generationMode", default)]
    pub mode: GenerationMode,
    /// Free-form client settings; unrecognized keys are ignored.
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub run_id: Uuid,
    pub stream_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// RunService
// ---------------------------------------------------------------------------

pub struct RunService {
    orchestrator: Arc<Orchestrator>,
    gate: RateLimitGate,
    heartbeat: Duration,
}

impl RunService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let config = orchestrator.config();
        let gate = RateLimitGate::new(config.rate_limit_default, config.rate_limit_expensive)
            .with_expensive_prefixes(vec![GENERATE_PATH.to_string()]);
        Self {
            orchestrator,
            gate,
            heartbeat: subscriber::DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_gate(mut self, gate: RateLimitGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub async fn start_generation(
        &self,
        caller: &Caller,
        request: StartRequest,
    ) -> Result<StartResponse, ApiError> {
        self.gate.admit(&caller.identity(), GENERATE_PATH)?;

        let run_id = self
            .orchestrator
            .start_generation(&request.project_id, &request.seed_idea, request.llm, request.mode)
            .await?;
        Ok(StartResponse {
            run_id,
            stream_path: format!("/api/runs/{run_id}/events"),
        })
    }

    /// Connected frame, full replay, then live tail with keepalives; the
    /// channel closes after a terminal frame.
    pub async fn stream_events(
        &self,
        caller: &Caller,
        run_id: Uuid,
    ) -> Result<flume::Receiver<StreamFrame>, ApiError> {
        self.gate
            .admit(&caller.identity(), &format!("/api/runs/{run_id}/events"))?;
        // Unknown runs are a 404, not an empty stream.
        self.orchestrator.get_status(run_id).await?;
        Ok(subscriber::subscribe(
            self.orchestrator.events(),
            run_id,
            self.heartbeat,
        ))
    }

    pub async fn get_status(&self, caller: &Caller, run_id: Uuid) -> Result<RunStatus, ApiError> {
        self.gate
            .admit(&caller.identity(), &format!("/api/runs/{run_id}"))?;
        Ok(self.orchestrator.get_status(run_id).await?)
    }

    pub async fn list_runs(&self, caller: &Caller) -> Result<Vec<RunStatus>, ApiError> {
        self.gate.admit(&caller.identity(), "/api/runs")?;
        Ok(self.orchestrator.list_runs().await)
    }

    pub async fn pause(&self, caller: &Caller, run_id: Uuid) -> Result<ActionResponse, ApiError> {
        self.gate
            .admit(&caller.identity(), &format!("/api/runs/{run_id}/pause"))?;
        self.orchestrator.pause(run_id).await?;
        Ok(ActionResponse {
            success: true,
            message: format!("run {run_id} paused"),
        })
    }

    pub async fn resume(&self, caller: &Caller, run_id: Uuid) -> Result<ActionResponse, ApiError> {
        self.gate
            .admit(&caller.identity(), &format!("/api/runs/{run_id}/resume"))?;
        self.orchestrator.resume(run_id).await?;
        Ok(ActionResponse {
            success: true,
            message: format!("run {run_id} resumed"),
        })
    }

    pub async fn cancel(&self, caller: &Caller, run_id: Uuid) -> Result<ActionResponse, ApiError> {
        self.gate
            .admit(&caller.identity(), &format!("/api/runs/{run_id}/cancel"))?;
        self.orchestrator.cancel(run_id).await?;
        Ok(ActionResponse {
            success: true,
            message: format!("run {run_id} cancelled"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
