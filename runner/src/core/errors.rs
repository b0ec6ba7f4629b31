//! Typed fatal errors and their classification.
//!
//! Orchestration returns `anyhow::Result`; the variants here are recovered
//! with `downcast_ref` to decide the exit code and the persisted `error`.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::exit_codes;

/// A path resolved outside the sandbox root. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("path escapes sandbox: {input} resolves to {resolved} (root {root})")]
pub struct PathEscapeError {
    pub input: String,
    pub resolved: PathBuf,
    pub root: PathBuf,
}

/// Which hard budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    Turns,
    OracleCalls,
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetKind::Turns => f.write_str("turn"),
            BudgetKind::OracleCalls => f.write_str("oracle call"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} budget exceeded: limit {limit}")]
pub struct BudgetExceededError {
    pub kind: BudgetKind,
    pub limit: u32,
}

/// An oracle call failed on every allowed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("oracle call '{label}' failed after {attempts} attempt(s): {last_error}")]
pub struct OracleExhaustedError {
    pub label: String,
    pub attempts: u32,
    pub last_error: String,
}

/// No plan candidate survived generation and validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no valid plan: all {requested} candidate(s) failed or were empty")]
pub struct NoValidPlanError {
    pub requested: usize,
}

/// Coarse classification of a run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    PathEscape,
    BudgetExceeded,
    NoValidPlan,
    OracleExhausted,
    Other,
}

impl FailureKind {
    pub fn classify(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<PathEscapeError>().is_some() {
            return FailureKind::PathEscape;
        }
        if err.downcast_ref::<BudgetExceededError>().is_some() {
            return FailureKind::BudgetExceeded;
        }
        if err.downcast_ref::<NoValidPlanError>().is_some() {
            return FailureKind::NoValidPlan;
        }
        if err.downcast_ref::<OracleExhaustedError>().is_some() {
            return FailureKind::OracleExhausted;
        }
        FailureKind::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PathEscape => "path_escape",
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::NoValidPlan => "no_valid_plan",
            FailureKind::OracleExhausted => "oracle_exhausted",
            FailureKind::Other => "error",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            FailureKind::PathEscape => exit_codes::PATH_ESCAPE,
            FailureKind::BudgetExceeded => exit_codes::BUDGET_EXCEEDED,
            FailureKind::NoValidPlan | FailureKind::OracleExhausted => exit_codes::NO_PROGRESS,
            FailureKind::Other => exit_codes::INVALID,
        }
    }
}
