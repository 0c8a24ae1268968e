use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// A node in the generation pipeline.
///
/// The per-scene draft/critique/revise/polish loop is nested inside
/// `Drafting`; `Critique` and `Revision` here are the manuscript-level
/// passes that run after all scenes are finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Genesis,
    Characters,
    NarratorDesign,
    Worldbuilding,
    Outlining,
    AdvancedPlanning,
    Drafting,
    Critique,
    Revision,
    OriginalityCheck,
    ImpactAssessment,
    Polish,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Genesis => "genesis",
            Phase::Characters => "characters",
            Phase::NarratorDesign => "narrator_design",
            Phase::Worldbuilding => "worldbuilding",
            Phase::Outlining => "outlining",
            Phase::AdvancedPlanning => "advanced_planning",
            Phase::Drafting => "drafting",
            Phase::Critique => "critique",
            Phase::Revision => "revision",
            Phase::OriginalityCheck => "originality_check",
            Phase::ImpactAssessment => "impact_assessment",
            Phase::Polish => "polish",
            Phase::Complete => "complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    /// An advance was requested from a phase with no unconditional
    /// successor, or after the terminal phase.
    #[error("no unconditional transition out of phase {phase}")]
    NoSuccessor { phase: Phase },
    /// `resolve_critique` was called while not in the critique phase.
    #[error("critique resolution requested in phase {phase}")]
    NotInCritique { phase: Phase },
}

// ---------------------------------------------------------------------------
// PhaseMachine
// ---------------------------------------------------------------------------

/// The generation phase graph as an explicit transition machine.
///
/// Transitions are unconditional except `Critique`, which branches to
/// `Revision` or `OriginalityCheck` depending on the critic's verdict and
/// the revision budget. The machine never moves backwards except through
/// the `Revision -> Critique` self-loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMachine {
    current: Phase,
    history: Vec<(Phase, Phase)>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: Phase::Genesis,
            history: Vec::new(),
        }
    }

    /// Resume a machine at a known phase (snapshot restore).
    pub fn at(phase: Phase) -> Self {
        Self {
            current: phase,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn history(&self) -> &[(Phase, Phase)] {
        &self.history
    }

    /// Advance along the unconditional edge out of the current phase.
    pub fn advance(&mut self) -> Result<Phase, PhaseError> {
        let next = match self.current {
            Phase::Genesis => Phase::Characters,
            Phase::Characters => Phase::NarratorDesign,
            Phase::NarratorDesign => Phase::Worldbuilding,
            Phase::Worldbuilding => Phase::Outlining,
            Phase::Outlining => Phase::AdvancedPlanning,
            Phase::AdvancedPlanning => Phase::Drafting,
            Phase::Drafting => Phase::Critique,
            Phase::Revision => Phase::Critique,
            Phase::OriginalityCheck => Phase::ImpactAssessment,
            Phase::ImpactAssessment => Phase::Polish,
            Phase::Polish => Phase::Complete,
            Phase::Critique | Phase::Complete => {
                return Err(PhaseError::NoSuccessor {
                    phase: self.current,
                })
            }
        };
        self.transition_to(next);
        Ok(next)
    }

    /// Resolve the guarded `Critique -> {Revision | OriginalityCheck}`
    /// branch. Exceeding the revision budget forces the originality branch
    /// regardless of the critic's verdict.
    pub fn resolve_critique(
        &mut self,
        revision_needed: bool,
        revisions_used: u32,
        max_revisions: u32,
    ) -> Result<Phase, PhaseError> {
        if self.current != Phase::Critique {
            return Err(PhaseError::NotInCritique {
                phase: self.current,
            });
        }
        let next = if revision_needed && revisions_used < max_revisions {
            Phase::Revision
        } else {
            Phase::OriginalityCheck
        };
        self.transition_to(next);
        Ok(next)
    }

    fn transition_to(&mut self, next: Phase) {
        let from = self.current;
        self.current = next;
        self.history.push((from, next));
        tracing::debug!(from = %from, to = %next, "phase transition");
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_unconditional_chain() {
        let mut machine = PhaseMachine::new();
        let expected = [
            Phase::Characters,
            Phase::NarratorDesign,
            Phase::Worldbuilding,
            Phase::Outlining,
            Phase::AdvancedPlanning,
            Phase::Drafting,
            Phase::Critique,
        ];
        for phase in expected {
            assert_eq!(machine.advance().unwrap(), phase);
        }
    }

    #[test]
    fn critique_requires_resolution() {
        let mut machine = PhaseMachine::at(Phase::Critique);
        assert!(machine.advance().is_err());
        let next = machine.resolve_critique(true, 0, 2).unwrap();
        assert_eq!(next, Phase::Revision);
    }

    #[test]
    fn revision_loops_back_to_critique() {
        let mut machine = PhaseMachine::at(Phase::Critique);
        machine.resolve_critique(true, 0, 2).unwrap();
        assert_eq!(machine.current(), Phase::Revision);
        assert_eq!(machine.advance().unwrap(), Phase::Critique);
    }

    #[test]
    fn revision_budget_forces_originality() {
        let mut machine = PhaseMachine::at(Phase::Critique);
        let next = machine.resolve_critique(true, 2, 2).unwrap();
        assert_eq!(next, Phase::OriginalityCheck);
    }

    #[test]
    fn approved_critique_moves_to_originality() {
        let mut machine = PhaseMachine::at(Phase::Critique);
        let next = machine.resolve_critique(false, 0, 2).unwrap();
        assert_eq!(next, Phase::OriginalityCheck);
    }

    #[test]
    fn polish_is_terminal() {
        let mut machine = PhaseMachine::at(Phase::Polish);
        assert_eq!(machine.advance().unwrap(), Phase::Complete);
        assert!(machine.advance().is_err());
    }

    #[test]
    fn resolve_outside_critique_is_rejected() {
        let mut machine = PhaseMachine::new();
        assert!(machine.resolve_critique(true, 0, 2).is_err());
    }
}
