//! Harness: provider abstractions and reliability infrastructure for the
//! storyforge generation engine.
//!
//! This crate is the execution layer between the orchestration logic and the
//! outside world. It coordinates:
//! - LLM provider abstraction (Anthropic, OpenAI, mock) behind [`provider::LlmClient`]
//! - Prompt compilation with baked-in fallback templates and a TTL cache
//! - Sliding-window admission control shared across all ingress paths
//! - The evaluation concurrency limiter (fire-and-forget, semaphore-gated)
//! - Cooperative shutdown coordination with bounded drain
//! - Vector and artifact store traits with in-memory implementations

pub mod artifact_store;
pub mod eval_limiter;
pub mod prompts;
pub mod provider;
pub mod rate_limiter;
pub mod shutdown;
pub mod vector_store;
