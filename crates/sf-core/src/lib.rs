//! Core data model for the storyforge narrative generation engine.
//!
//! This crate defines the domain types shared by every other crate in the
//! workspace: generation runs and their artifacts, the phase state machine,
//! the append-only constraint store, the canonical world-state document and
//! its diff applier, configuration, and the snapshot projection used for
//! restart survival.

pub mod casing;
pub mod config;
pub mod constraint;
pub mod phase;
pub mod snapshot;
pub mod types;
pub mod world_state;
