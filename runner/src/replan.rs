//! Turn-end replanning from the full execution history.

use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};
use tracing::{instrument, warn};

use crate::core::catalog::render_catalog;
use crate::core::critic_signals::OBSERVATION_LIMIT_BYTES;
use crate::core::plan::parse_steps;
use crate::core::schemas::{self, REPLAN_OUTPUT_SCHEMA};
use crate::core::text::truncate_marked;
use crate::core::types::{AgentState, HistoryEntry, ReplanDecision};
use crate::gateway::{OracleCall, OracleGateway};
use crate::io::oracle::OracleTemplate;

pub struct Replanner {
    schema: Value,
    catalog: String,
    step_schema: String,
    criteria: Option<String>,
    max_turns: u32,
    temperature: f32,
}

impl Replanner {
    pub fn new(max_turns: u32, temperature: f32, criteria: Option<String>) -> Result<Self> {
        Ok(Self {
            schema: schemas::load(REPLAN_OUTPUT_SCHEMA)?,
            catalog: render_catalog(),
            step_schema: serde_json::to_string_pretty(&schemas::step_schema())?,
            criteria,
            max_turns,
            temperature,
        })
    }

    /// Decide the next turn. Invalid answers consume retry attempts; an
    /// exhausted call is returned as an error.
    #[instrument(skip_all, fields(turn = state.current_turn))]
    pub fn replan(&self, gateway: &OracleGateway<'_>, state: &AgentState) -> Result<ReplanDecision> {
        let call = OracleCall {
            template: OracleTemplate::Replan,
            label: format!("replan-t{}", state.current_turn),
            variables: json!({
                "task": state.task,
                "turn": state.current_turn,
                "max_turns": self.max_turns,
                "step_schema": self.step_schema,
                "catalog": self.catalog,
                "criteria": self.criteria,
                "history": render_history(&state.execution_history),
            }),
            schema: &self.schema,
            temperature: self.temperature,
        };
        gateway.call(call, parse_decision)
    }
}

/// Interpret a schema-valid replan document.
pub fn parse_decision(value: &Value) -> Result<ReplanDecision> {
    let completed = value["completed"]
        .as_bool()
        .ok_or_else(|| anyhow!("replan output missing completed"))?;
    if completed {
        let answer = value["final_answer"].as_str().unwrap_or_default().trim();
        if answer.is_empty() {
            bail!("completed=true requires a non-empty final_answer");
        }
        return Ok(ReplanDecision::Complete {
            final_answer: answer.to_string(),
        });
    }
    let raw = value["next_steps"].as_array().cloned().unwrap_or_default();
    let parsed = parse_steps(&raw);
    for reason in &parsed.skipped {
        warn!(%reason, "skipping malformed replan step");
    }
    if parsed.steps.is_empty() {
        bail!("completed=false requires at least one valid next step");
    }
    Ok(ReplanDecision::Continue {
        next_steps: parsed.steps,
    })
}

/// One block per executed step, oldest first.
pub fn render_history(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return "(nothing executed yet)".to_string();
    }
    history
        .iter()
        .map(|entry| {
            let params = entry
                .step
                .parameters
                .iter()
                .map(|p| format!("{}={}", p.name, truncate_marked(&p.value, 200)))
                .collect::<Vec<_>>()
                .join(", ");
            let status = if entry.result.success { "ok" } else { "failed" };
            format!(
                "[turn {}] {}({}) -> {} in {}s\n{}",
                entry.turn,
                entry.step.tool,
                params,
                status,
                entry.result.duration,
                truncate_marked(entry.result.observation(), OBSERVATION_LIMIT_BYTES)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
