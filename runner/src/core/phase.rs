//! Orchestrator phase machine.
//!
//! `Init → Planning → Executing ⇄ Critiquing → Replanning → {Executing | Completed | Failed}`.
//! Any non-terminal phase may fail. Terminal phases accept nothing.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Planning,
    Executing,
    Critiquing,
    Replanning,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal phase transition: {from} -> {to}")]
pub struct PhaseError {
    pub from: RunPhase,
    pub to: RunPhase,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Init => "init",
            RunPhase::Planning => "planning",
            RunPhase::Executing => "executing",
            RunPhase::Critiquing => "critiquing",
            RunPhase::Replanning => "replanning",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }

    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        if next == RunPhase::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (RunPhase::Init, RunPhase::Planning)
                | (RunPhase::Planning, RunPhase::Executing)
                | (RunPhase::Executing, RunPhase::Critiquing)
                | (RunPhase::Critiquing, RunPhase::Executing)
                | (RunPhase::Executing, RunPhase::Replanning)
                | (RunPhase::Replanning, RunPhase::Executing)
                | (RunPhase::Replanning, RunPhase::Completed)
        )
    }

    /// Move to `next`, rejecting transitions the loop never makes.
    pub fn advance(&mut self, next: RunPhase) -> Result<(), PhaseError> {
        if !self.can_transition_to(next) {
            return Err(PhaseError {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
