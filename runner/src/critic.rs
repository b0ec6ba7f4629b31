//! Optional pre-execution review of each planned step.

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::catalog::render_catalog;
use crate::core::critic_signals::{CriticContext, build_critic_input};
use crate::core::errors::{FailureKind, OracleExhaustedError};
use crate::core::plan::parse_steps;
use crate::core::schemas::{self, CRITIC_OUTPUT_SCHEMA};
use crate::core::types::{AgentState, CriticOutput, Step};
use crate::gateway::{OracleCall, OracleGateway};
use crate::io::oracle::OracleTemplate;

/// What to do with the reviewed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Run the step as planned.
    Approve,
    /// Run these steps instead, without another review.
    Patch(Vec<Step>),
    /// Skip the step and record it as failed.
    Block { comment: String },
    /// The critic could not be reached; record the step as failed.
    Unavailable { reason: String },
}

impl Verdict {
    pub fn from_output(output: CriticOutput) -> Self {
        if output.ok {
            return Verdict::Approve;
        }
        if output.patch.is_empty() {
            let comment = match output.discarded_patch_steps {
                0 => output.comment,
                n => format!("{} (patch rejected: {n} malformed steps)", output.comment),
            };
            return Verdict::Block { comment };
        }
        Verdict::Patch(output.patch)
    }
}

pub struct Critic {
    schema: Value,
    catalog: String,
    temperature: f32,
}

impl Critic {
    pub fn new(temperature: f32) -> Result<Self> {
        Ok(Self {
            schema: schemas::load(CRITIC_OUTPUT_SCHEMA)?,
            catalog: render_catalog(),
            temperature,
        })
    }

    /// Review `candidate`, the `position`-th step of the current turn.
    ///
    /// Only a budget refusal is returned as an error; an exhausted critic
    /// call becomes [`Verdict::Unavailable`].
    #[instrument(skip_all, fields(turn = state.current_turn, position, tool = %candidate.tool))]
    pub fn review(
        &self,
        gateway: &OracleGateway<'_>,
        state: &AgentState,
        candidate: &Step,
        upcoming: &[Step],
        position: usize,
        ctx: &CriticContext<'_>,
    ) -> Result<Verdict> {
        let input = build_critic_input(state, candidate, upcoming, ctx);
        let call = OracleCall {
            template: OracleTemplate::Critic,
            label: format!("critic-t{}-s{position}", state.current_turn),
            variables: json!({
                "critic_input": serde_json::to_string_pretty(&input)?,
                "catalog": self.catalog,
            }),
            schema: &self.schema,
            temperature: self.temperature,
        };
        match gateway.call(call, parse_output) {
            Ok(output) => {
                debug!(
                    ok = output.ok,
                    score = output.score,
                    comment = %output.comment,
                    patch_steps = output.patch.len(),
                    "critic verdict"
                );
                Ok(Verdict::from_output(output))
            }
            Err(err) if FailureKind::classify(&err) == FailureKind::BudgetExceeded => Err(err),
            Err(err) => {
                let reason = match err.downcast_ref::<OracleExhaustedError>() {
                    Some(exhausted) => exhausted.last_error.clone(),
                    None => format!("{err:#}"),
                };
                warn!(%reason, "critic unavailable");
                Ok(Verdict::Unavailable { reason })
            }
        }
    }
}

/// Parse a schema-valid critic document. Malformed patch steps are dropped.
pub fn parse_output(value: &Value) -> Result<CriticOutput> {
    let ok = value["ok"]
        .as_bool()
        .ok_or_else(|| anyhow!("critic output missing ok"))?;
    let score = value["score"]
        .as_u64()
        .ok_or_else(|| anyhow!("critic output missing score"))?
        .min(10) as u8;
    let comment = value["comment"].as_str().unwrap_or_default().to_string();
    let raw_patch = value["patch"].as_array().cloned().unwrap_or_default();
    let parsed = parse_steps(&raw_patch);
    for reason in &parsed.skipped {
        warn!(%reason, "skipping malformed patch step");
    }
    Ok(CriticOutput {
        ok,
        score,
        comment,
        discarded_patch_steps: parsed.skipped.len(),
        patch: parsed.steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approve_ignores_patch() {
        let output = parse_output(&json!({
            "ok": true,
            "score": 9,
            "comment": "fine",
            "patch": [{"tool": "read_file", "reasoning": "r", "parameters": [{"name": "path", "value": "a"}]}]
        }))
        .expect("parse");
        assert_eq!(Verdict::from_output(output), Verdict::Approve);
    }

    #[test]
    fn block_with_patch_substitutes_valid_steps() {
        let output = parse_output(&json!({
            "ok": false,
            "score": 2,
            "comment": "path escapes sandbox",
            "patch": [
                {},
                {"tool": "write_file", "reasoning": "inside", "parameters": [
                    {"name": "path", "value": "out.txt"},
                    {"name": "content", "value": "x"}
                ]}
            ]
        }))
        .expect("parse");
        match Verdict::from_output(output) {
            Verdict::Patch(steps) => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].param("path"), Some("out.txt"));
            }
            other => panic!("expected patch, got {other:?}"),
        }
    }

    #[test]
    fn block_without_usable_patch_blocks() {
        let output = parse_output(&json!({
            "ok": false,
            "score": 0,
            "comment": "destructive",
            "patch": [{}]
        }))
        .expect("parse");
        assert_eq!(
            Verdict::from_output(output),
            Verdict::Block {
                comment: "destructive (patch rejected: 1 malformed steps)".to_string()
            }
        );
    }

    #[test]
    fn block_without_patch_keeps_comment() {
        let output = parse_output(&json!({
            "ok": false,
            "score": 1,
            "comment": "pointless",
            "patch": []
        }))
        .expect("parse");
        assert_eq!(output.discarded_patch_steps, 0);
        assert_eq!(
            Verdict::from_output(output),
            Verdict::Block {
                comment: "pointless".to_string()
            }
        );
    }
}
