//! Shared deterministic types for the orchestrator.
//!
//! These types are the stable contracts exchanged with the oracle and
//! persisted to disk. They carry no I/O and serialize deterministically.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// One named step parameter. Order within a step is significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Param {
    pub name: String,
    pub value: String,
}

/// One planned tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub tool: String,
    pub reasoning: String,
    pub parameters: Vec<Param>,
}

impl Step {
    /// First value for parameter `name`, if present.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Same tool with the same parameters (reasoning is ignored).
    pub fn same_invocation(&self, other: &Step) -> bool {
        self.tool == other.tool && self.parameters == other.parameters
    }
}

/// Outcome of executing one step. Exactly one of `output`/`error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration in whole seconds.
    pub duration: u64,
}

impl StepResult {
    pub fn ok(output: impl Into<String>, duration: u64) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            duration,
        }
    }

    pub fn failed(error: impl Into<String>, duration: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            duration,
        }
    }

    /// Output on success, error otherwise.
    pub fn observation(&self) -> &str {
        if self.success {
            self.output.as_deref().unwrap_or("")
        } else {
            self.error.as_deref().unwrap_or("")
        }
    }
}

/// Append-only record of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub turn: u32,
    pub step: Step,
    pub result: StepResult,
}

/// The orchestrator's single source of truth, persisted after every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub task: String,
    pub completed: bool,
    pub current_turn: u32,
    pub next_steps: Vec<Step>,
    pub execution_history: Vec<HistoryEntry>,
    pub final_answer: Option<String>,
    pub error: Option<String>,
}

impl AgentState {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            completed: false,
            current_turn: 0,
            next_steps: Vec::new(),
            execution_history: Vec::new(),
            final_answer: None,
            error: None,
        }
    }
}

/// Static safety constraints the critic evaluates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyConstraint {
    NoFileOpsOutsideSandbox,
    NoNetworkInternalIps,
    MaxFileSize32kb,
    NoSystemCommands,
    NoDestructiveOperations,
}

impl SafetyConstraint {
    pub const ALL: [SafetyConstraint; 5] = [
        SafetyConstraint::NoFileOpsOutsideSandbox,
        SafetyConstraint::NoNetworkInternalIps,
        SafetyConstraint::MaxFileSize32kb,
        SafetyConstraint::NoSystemCommands,
        SafetyConstraint::NoDestructiveOperations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyConstraint::NoFileOpsOutsideSandbox => "no_file_ops_outside_sandbox",
            SafetyConstraint::NoNetworkInternalIps => "no_network_internal_ips",
            SafetyConstraint::MaxFileSize32kb => "max_file_size_32kb",
            SafetyConstraint::NoSystemCommands => "no_system_commands",
            SafetyConstraint::NoDestructiveOperations => "no_destructive_operations",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalConstraints {
    pub files_created: Vec<String>,
    pub files_expected: Vec<String>,
    pub deadline_turns: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePatterns {
    /// Trailing consecutive failures per tool name.
    pub repeated_tool_failures: BTreeMap<String, u32>,
    pub stuck_iterations: bool,
}

/// Everything the critic sees about one candidate step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticInput {
    pub task: String,
    pub candidate_step: Step,
    pub turn: u32,
    pub max_turns: u32,
    pub last_observation: Option<String>,
    pub plan_remainder: Vec<Step>,
    pub execution_history_tail: Vec<HistoryEntry>,
    pub sandbox_path: String,
    pub temporal_constraints: TemporalConstraints,
    pub failure_patterns: FailurePatterns,
    pub safety_constraints: BTreeSet<SafetyConstraint>,
}

/// Critic verdict. `patch` only matters when `ok` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticOutput {
    pub ok: bool,
    pub score: u8,
    pub comment: String,
    pub patch: Vec<Step>,
    /// Patch steps dropped as malformed while parsing.
    #[serde(skip)]
    pub discarded_patch_steps: usize,
}

/// What the replanner decided for the next turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplanDecision {
    Complete { final_answer: String },
    Continue { next_steps: Vec<Step> },
}
