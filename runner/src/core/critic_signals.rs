//! Derive the critic's view of a run from the agent state.
//!
//! Pure functions only; the critic module decides when to call the oracle.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::core::catalog::ToolName;
use crate::core::text::truncate_marked;
use crate::core::types::{
    AgentState, CriticInput, FailurePatterns, HistoryEntry, SafetyConstraint, Step,
    TemporalConstraints,
};

pub const PLAN_REMAINDER_LIMIT: usize = 3;
pub const HISTORY_TAIL_LIMIT: usize = 3;
pub const OBSERVATION_LIMIT_BYTES: usize = 2 * 1024;
/// Identical failing invocations in a row that count as stuck.
pub const STUCK_THRESHOLD: usize = 3;

/// Run-level context that does not live in `AgentState`.
#[derive(Debug, Clone)]
pub struct CriticContext<'a> {
    pub max_turns: u32,
    pub sandbox_path: &'a str,
    /// Paths named by verification criteria, if any were configured.
    pub expected_paths: &'a [String],
    pub safety_constraints: &'a BTreeSet<SafetyConstraint>,
}

/// Build the critic input for `candidate`, the step about to run.
///
/// `upcoming` is the rest of the current plan after `candidate`.
pub fn build_critic_input(
    state: &AgentState,
    candidate: &Step,
    upcoming: &[Step],
    ctx: &CriticContext<'_>,
) -> CriticInput {
    let files_created = files_created(&state.execution_history);
    let files_expected = ctx
        .expected_paths
        .iter()
        .filter(|path| !files_created.contains(*path))
        .cloned()
        .collect();
    CriticInput {
        task: state.task.clone(),
        candidate_step: candidate.clone(),
        turn: state.current_turn,
        max_turns: ctx.max_turns,
        last_observation: last_observation(&state.execution_history),
        plan_remainder: upcoming.iter().take(PLAN_REMAINDER_LIMIT).cloned().collect(),
        execution_history_tail: history_tail(&state.execution_history).to_vec(),
        sandbox_path: ctx.sandbox_path.to_string(),
        temporal_constraints: TemporalConstraints {
            files_created,
            files_expected,
            deadline_turns: Some(ctx.max_turns.saturating_sub(state.current_turn)),
        },
        failure_patterns: failure_patterns(&state.execution_history),
        safety_constraints: ctx.safety_constraints.clone(),
    }
}

pub fn history_tail(history: &[HistoryEntry]) -> &[HistoryEntry] {
    &history[history.len().saturating_sub(HISTORY_TAIL_LIMIT)..]
}

pub fn last_observation(history: &[HistoryEntry]) -> Option<String> {
    history
        .last()
        .map(|entry| truncate_marked(entry.result.observation(), OBSERVATION_LIMIT_BYTES))
}

/// Paths written by successful file-producing steps, first occurrence order.
pub fn files_created(history: &[HistoryEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    history
        .iter()
        .filter(|entry| entry.result.success)
        .filter(|entry| ToolName::parse(&entry.step.tool).is_some_and(|tool| tool.writes_file()))
        .filter_map(|entry| entry.step.param("path"))
        .filter(|path| seen.insert(path.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn failure_patterns(history: &[HistoryEntry]) -> FailurePatterns {
    FailurePatterns {
        repeated_tool_failures: trailing_failures(history),
        stuck_iterations: is_stuck(history),
    }
}

/// Consecutive failures per tool counted back from the most recent entry.
///
/// A tool's streak ends at its most recent success.
fn trailing_failures(history: &[HistoryEntry]) -> BTreeMap<String, u32> {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    let mut closed: HashSet<&str> = HashSet::new();
    for entry in history.iter().rev() {
        let tool = entry.step.tool.as_str();
        if closed.contains(tool) {
            continue;
        }
        if entry.result.success {
            closed.insert(tool);
        } else {
            *counts.entry(tool.to_string()).or_default() += 1;
        }
    }
    counts
}

/// True when the last few entries are the same invocation failing each time.
fn is_stuck(history: &[HistoryEntry]) -> bool {
    if history.len() < STUCK_THRESHOLD {
        return false;
    }
    let tail = &history[history.len() - STUCK_THRESHOLD..];
    let first = &tail[0].step;
    tail.iter()
        .all(|entry| !entry.result.success && entry.step.same_invocation(first))
}
