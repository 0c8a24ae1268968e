//! Agent layer for the storyforge generation engine.
//!
//! Every "agent" here is a thin adapter: it packages context into a prompt,
//! calls the LLM client through the [`runner::AgentRunner`], and normalizes
//! the loosely-structured result into the typed shapes the orchestrator
//! consumes. The crate also carries the scene drafting engine (beats mode,
//! overlap stripping, expansion, critique evaluation, polish validation),
//! the archivist continuity pass, and the fire-and-forget evaluators.

pub mod archivist;
pub mod drafting;
pub mod evaluation;
pub mod normalizer;
pub mod roles;
pub mod runner;
