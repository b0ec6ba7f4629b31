//! Initial plan generation: parallel candidates, dedup, selection.
//!
//! Candidates are generated on scoped threads and joined before anything
//! else happens. A candidate that fails is dropped with a warning; only a
//! budget refusal aborts the whole fan-out.

use std::thread;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::core::catalog::render_catalog;
use crate::core::errors::{FailureKind, NoValidPlanError};
use crate::core::plan::{Candidate, content_hash, dedup_candidates, parse_steps, resolve_winner};
use crate::core::schemas::{self, PLAN_OUTPUT_SCHEMA, SELECTOR_OUTPUT_SCHEMA};
use crate::gateway::{OracleCall, OracleGateway};
use crate::io::oracle::OracleTemplate;

/// Planning styles handed out round-robin so candidates differ.
const DIVERSITY_TOKENS: [&str; 4] = [
    "Take the most direct route; use as few steps as possible.",
    "Inspect existing inputs before producing outputs, and check results after writing them.",
    "Prefer local file tools; use the network only when the task requires it.",
    "Break the work into small, independently verifiable steps.",
];

/// Temperature step between consecutive candidates.
const TEMPERATURE_STEP: f32 = 0.2;
const MAX_TEMPERATURE: f32 = 2.0;

#[derive(Debug, Clone)]
pub struct PlanSettings<'a> {
    pub task: &'a str,
    pub candidates: usize,
    pub base_temperature: f32,
    pub file_limit_bytes: u64,
    /// Rendered success criteria, when configured.
    pub criteria: Option<&'a str>,
}

/// The plan the run starts from.
#[derive(Debug, Clone)]
pub struct SelectedPlan {
    pub candidate: Candidate,
    /// Candidates that survived generation.
    pub survived: usize,
    /// Unique candidates after dedup.
    pub unique: usize,
}

/// `base + 0.2 * index`, capped at the highest temperature the config accepts.
pub fn candidate_temperature(base: f32, index: usize) -> f32 {
    (base + TEMPERATURE_STEP * index as f32).min(MAX_TEMPERATURE)
}

pub fn diversity_token(index: usize) -> &'static str {
    DIVERSITY_TOKENS[index % DIVERSITY_TOKENS.len()]
}

#[instrument(skip_all, fields(candidates = settings.candidates))]
pub fn generate_plan(gateway: &OracleGateway<'_>, settings: &PlanSettings<'_>) -> Result<SelectedPlan> {
    let plan_schema = schemas::load(PLAN_OUTPUT_SCHEMA)?;
    let catalog = render_catalog();
    let step_schema = serde_json::to_string_pretty(&schemas::step_schema())?;

    let outcomes: Vec<Result<Option<Candidate>>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..settings.candidates)
            .map(|index| {
                let plan_schema = &plan_schema;
                let catalog = &catalog;
                let step_schema = &step_schema;
                scope.spawn(move || {
                    generate_candidate(gateway, settings, index, plan_schema, catalog, step_schema)
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("plan candidate {index} panicked")))
            })
            .collect()
    });

    let mut survivors = Vec::new();
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(Some(candidate)) => survivors.push(candidate),
            Ok(None) => {}
            Err(err) if FailureKind::classify(&err) == FailureKind::BudgetExceeded => {
                return Err(err);
            }
            Err(err) => {
                warn!(candidate = index, error = %format!("{err:#}"), "dropping plan candidate");
            }
        }
    }

    let survived = survivors.len();
    let mut unique = dedup_candidates(survivors);
    info!(survived, unique = unique.len(), "plan candidates collected");
    if unique.is_empty() {
        return Err(NoValidPlanError {
            requested: settings.candidates,
        }
        .into());
    }

    let winner = if unique.len() == 1 {
        0
    } else {
        select_winner(gateway, settings, &unique)?
    };
    let unique_count = unique.len();
    let candidate = unique.swap_remove(winner);
    info!(
        winner,
        candidate = candidate.index,
        hash = %candidate.hash,
        steps = candidate.steps.len(),
        "plan selected"
    );
    Ok(SelectedPlan {
        candidate,
        survived,
        unique: unique_count,
    })
}

/// Returns `Ok(None)` when the oracle answered but no step was usable.
fn generate_candidate(
    gateway: &OracleGateway<'_>,
    settings: &PlanSettings<'_>,
    index: usize,
    plan_schema: &Value,
    catalog: &str,
    step_schema: &str,
) -> Result<Option<Candidate>> {
    let call = OracleCall {
        template: OracleTemplate::Plan,
        label: format!("plan-{index}"),
        variables: json!({
            "task": settings.task,
            "candidate_index": index,
            "diversity": diversity_token(index),
            "catalog": catalog,
            "step_schema": step_schema,
            "file_limit_bytes": settings.file_limit_bytes,
            "criteria": settings.criteria,
        }),
        schema: plan_schema,
        temperature: candidate_temperature(settings.base_temperature, index),
    };
    let raw = gateway.call(call, |value| Ok(value.clone()))?;

    let steps_raw = raw["steps"].as_array().cloned().unwrap_or_default();
    let parsed = parse_steps(&steps_raw);
    for reason in &parsed.skipped {
        warn!(candidate = index, %reason, "skipping malformed plan step");
    }
    if parsed.steps.is_empty() {
        warn!(candidate = index, "plan candidate has no valid steps");
        return Ok(None);
    }
    Ok(Some(Candidate {
        index,
        hash: content_hash(&raw),
        raw,
        steps: parsed.steps,
    }))
}

/// Ask the selector for a winner. Falls back to the first candidate on any
/// failure other than a budget refusal.
fn select_winner(
    gateway: &OracleGateway<'_>,
    settings: &PlanSettings<'_>,
    unique: &[Candidate],
) -> Result<usize> {
    let schema = schemas::load(SELECTOR_OUTPUT_SCHEMA)?;
    let candidates: Vec<String> = unique
        .iter()
        .map(|candidate| serde_json::to_string_pretty(&candidate.raw))
        .collect::<Result<_, _>>()?;
    let call = OracleCall {
        template: OracleTemplate::Select,
        label: "select".to_string(),
        variables: json!({ "task": settings.task, "candidates": candidates }),
        schema: &schema,
        temperature: settings.base_temperature,
    };
    match gateway.call(call, |value| Ok(value["winner_index"].as_i64())) {
        Ok(answer) => {
            let winner = resolve_winner(unique.len(), answer);
            if answer != Some(winner as i64) {
                warn!(?answer, "selector answer out of range, using first candidate");
            }
            Ok(winner)
        }
        Err(err) if FailureKind::classify(&err) == FailureKind::BudgetExceeded => Err(err),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "selector failed, using first candidate");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperatures_spread_by_index() {
        assert!((candidate_temperature(0.2, 0) - 0.2).abs() < f32::EPSILON);
        assert!((candidate_temperature(0.2, 2) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn wide_fan_out_stays_within_accepted_range() {
        assert_eq!(candidate_temperature(0.2, 19), 2.0);
        assert_eq!(candidate_temperature(2.0, 1), 2.0);
        assert!((candidate_temperature(1.5, 2) - 1.9).abs() < 1e-6);
    }

    #[test]
    fn diversity_tokens_differ_for_default_fan_out() {
        assert_ne!(diversity_token(0), diversity_token(1));
        assert_ne!(diversity_token(1), diversity_token(2));
        assert_eq!(diversity_token(0), diversity_token(DIVERSITY_TOKENS.len()));
    }
}
