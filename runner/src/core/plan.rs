//! Plan parsing, canonicalization and deduplication.

use std::collections::HashSet;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::types::Step;

/// Steps that parsed cleanly plus a warning for every skipped entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSteps {
    pub steps: Vec<Step>,
    pub skipped: Vec<String>,
}

/// Parse raw step objects, skipping malformed ones.
///
/// A step is malformed when it does not deserialize (missing or extra
/// fields, `{}`), when `tool` is blank, or when it has no parameters.
/// Unknown tool names are *not* malformed; the executor reports them.
pub fn parse_steps(raw: &[Value]) -> ParsedSteps {
    let mut parsed = ParsedSteps::default();
    for (index, value) in raw.iter().enumerate() {
        match parse_step(value) {
            Ok(step) => parsed.steps.push(step),
            Err(reason) => parsed.skipped.push(format!("step[{index}]: {reason}")),
        }
    }
    parsed
}

fn parse_step(value: &Value) -> Result<Step, String> {
    let step: Step = serde_json::from_value(value.clone()).map_err(|err| err.to_string())?;
    if step.tool.trim().is_empty() {
        return Err("tool must be non-empty".to_string());
    }
    if step.parameters.is_empty() {
        return Err("parameters must have at least one entry".to_string());
    }
    if step.parameters.iter().any(|p| p.name.trim().is_empty()) {
        return Err("parameter names must be non-empty".to_string());
    }
    Ok(step)
}

/// Rebuild `value` with object keys inserted in sorted order.
///
/// The result serializes identically regardless of the original field order
/// or of whether `serde_json` preserves insertion order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Short content hash of the canonical JSON form.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// A plan candidate that survived generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Index of the generating call.
    pub index: usize,
    pub hash: String,
    pub raw: Value,
    pub steps: Vec<Step>,
}

/// Drop candidates whose canonical JSON was already seen. Keeps first occurrences in order.
pub fn dedup_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by_key(|c| c.index);
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.hash.clone()))
        .collect()
}

/// Resolve the selector's answer to an index into `count` unique candidates.
///
/// Falls back to the first candidate when the selector failed or answered out of range.
pub fn resolve_winner(count: usize, winner_index: Option<i64>) -> usize {
    match winner_index {
        Some(index) if index >= 0 && (index as usize) < count => index as usize,
        _ => 0,
    }
}
