//! The storyforge orchestration engine.
//!
//! Owns the run registry and the per-run tasks that walk the phase graph:
//! genesis through worldbuilding and outlining, the per-scene drafting loop
//! with its archivist cadence, the manuscript-level critique/revision loop,
//! originality and impact assessment, and final polish. Also the
//! transport-agnostic ingress facade, graceful shutdown with snapshots, and
//! startup restore.

pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod service;

pub use error::EngineError;
pub use orchestrator::Orchestrator;
pub use service::{ActionResponse, ApiError, Caller, RunService, StartRequest, StartResponse};
