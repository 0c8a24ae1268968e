use sf_agents::drafting::DraftError;
use sf_agents::runner::AgentError;
use sf_harness::artifact_store::ArtifactStoreError;
use sf_harness::provider::{FailureKind, LlmError};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Every failure class the engine distinguishes; see the per-variant
/// routing in the orchestrator's `handle_error`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad request or unknown run; surfaced to the caller, never retried.
    #[error("unknown run: {0}")]
    UnknownRun(Uuid),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Model output failed normalization with no safe fallback.
    #[error("validation failed in {phase}: {reason}")]
    Validation { phase: String, reason: String },

    /// Provider failure that exhausted its retries.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Scene-level failure that could not be recovered.
    #[error(transparent)]
    Draft(#[from] DraftError),

    #[error("provider setup failed: {0}")]
    Provider(#[from] LlmError),

    #[error(transparent)]
    Artifacts(#[from] ArtifactStoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The failure-kind label recorded on ERROR events.
    pub fn kind_label(&self) -> &'static str {
        match self {
            EngineError::UnknownRun(_) | EngineError::BadRequest(_) | EngineError::InvalidState(_) => {
                "client_error"
            }
            EngineError::Validation { .. } => "validation_error",
            EngineError::Agent(err) => match err.kind() {
                FailureKind::Validation => "validation_error",
                _ => "provider_error",
            },
            EngineError::Draft(DraftError::BeatInsufficient { .. }) => "consistency_error",
            EngineError::Draft(DraftError::Agent(_)) => "provider_error",
            EngineError::Draft(DraftError::Stopped) => "stopped",
            EngineError::Provider(_) => "provider_error",
            EngineError::Artifacts(_) | EngineError::Internal(_) => "internal_error",
        }
    }
}
