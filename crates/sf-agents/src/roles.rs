use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AgentRole
// ---------------------------------------------------------------------------

/// The specialized agent roles of the pipeline, one per phase (the Writer
/// and Strategist serve several phases; the Profiler also designs the
/// narrator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Profiler,
    Worldbuilder,
    Strategist,
    Writer,
    Critic,
    Originality,
    Impact,
    Archivist,
}

impl AgentRole {
    pub fn agent_id(&self) -> &'static str {
        match self {
            AgentRole::Architect => "architect",
            AgentRole::Profiler => "profiler",
            AgentRole::Worldbuilder => "worldbuilder",
            AgentRole::Strategist => "strategist",
            AgentRole::Writer => "writer",
            AgentRole::Critic => "critic",
            AgentRole::Originality => "originality",
            AgentRole::Impact => "impact",
            AgentRole::Archivist => "archivist",
        }
    }

    /// Per-phase completion ceiling. The Writer gets the most room since
    /// scenes can run to several thousand words.
    pub fn max_tokens(&self) -> u32 {
        match self {
            AgentRole::Writer => 8192,
            AgentRole::Architect | AgentRole::Worldbuilder | AgentRole::Strategist => 4096,
            AgentRole::Profiler | AgentRole::Archivist => 4096,
            AgentRole::Critic => 2048,
            AgentRole::Originality | AgentRole::Impact => 2048,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.agent_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ids_are_stable() {
        assert_eq!(AgentRole::Architect.agent_id(), "architect");
        assert_eq!(AgentRole::Archivist.agent_id(), "archivist");
    }

    #[test]
    fn writer_has_the_largest_ceiling() {
        for role in [
            AgentRole::Architect,
            AgentRole::Profiler,
            AgentRole::Critic,
            AgentRole::Archivist,
        ] {
            assert!(AgentRole::Writer.max_tokens() >= role.max_tokens());
        }
    }
}
