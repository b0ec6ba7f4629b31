//! JSON schemas for oracle outputs and persisted state.
//!
//! Output schemas keep step items loose (`{"type": "object"}`) so one
//! malformed step can be skipped without discarding the whole document.
//! The strict step schema is derived from the tool catalog and handed to the
//! oracle as guidance.

use anyhow::{Result, anyhow};
use jsonschema::validator_for;
use serde_json::{Value, json};

use crate::core::catalog::tool_names;

pub const PLAN_OUTPUT_SCHEMA: &str = include_str!("../../../schemas/plan_output.schema.json");
pub const SELECTOR_OUTPUT_SCHEMA: &str =
    include_str!("../../../schemas/selector_output.schema.json");
pub const CRITIC_OUTPUT_SCHEMA: &str = include_str!("../../../schemas/critic_output.schema.json");
pub const REPLAN_OUTPUT_SCHEMA: &str = include_str!("../../../schemas/replan_output.schema.json");
pub const AGENT_STATE_SCHEMA: &str = include_str!("../../../schemas/agent_state.schema.json");

/// Parse one of the bundled schema constants.
pub fn load(schema: &str) -> Result<Value> {
    serde_json::from_str(schema).map_err(|err| anyhow!("bundled schema is not json: {err}"))
}

/// Strict step schema with the catalog's tool names as an enum.
pub fn step_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["tool", "reasoning", "parameters"],
        "properties": {
            "tool": { "type": "string", "enum": tool_names() },
            "reasoning": { "type": "string" },
            "parameters": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["name", "value"],
                    "properties": {
                        "name": { "type": "string", "minLength": 1 },
                        "value": { "type": "string" }
                    }
                }
            }
        }
    })
}

/// Validate `instance` against `schema`, joining every violation into one error.
pub fn validate(schema: &Value, instance: &Value, what: &str) -> Result<()> {
    let compiled = validator_for(schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(instance) {
        let messages = compiled
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "{what} schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
