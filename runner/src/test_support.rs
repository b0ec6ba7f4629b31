//! Test-only helpers: a scripted oracle and step/reply builders.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::retry::RetryPolicy;
use crate::core::types::{Param, SafetyConstraint, Step};
use crate::io::oracle::{Oracle, OracleRequest, OracleTemplate};
use crate::io::sandbox::PathGuard;
use crate::io::tools::{StepExecutor, ToolContext, ToolLimits, ToolRegistry};
use crate::orchestrator::RunSettings;

/// One call seen by [`ScriptedOracle`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub template: OracleTemplate,
    pub label: String,
    pub variables: Value,
    pub temperature: f32,
}

type Reply = Result<Value, String>;

/// Oracle that replays predetermined documents.
///
/// Plan replies are keyed by candidate index so parallel candidates get
/// deterministic answers; every other template pops from its own queue.
#[derive(Default)]
pub struct ScriptedOracle {
    plans: Mutex<BTreeMap<u64, VecDeque<Reply>>>,
    queues: Mutex<HashMap<OracleTemplate, VecDeque<Reply>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plan reply for candidate `index`.
    pub fn plan(self, index: u64, reply: Value) -> Self {
        self.push_plan(index, Ok(reply))
    }

    pub fn plan_failure(self, index: u64, message: &str) -> Self {
        self.push_plan(index, Err(message.to_string()))
    }

    pub fn reply(self, template: OracleTemplate, reply: Value) -> Self {
        self.push(template, Ok(reply))
    }

    pub fn failure(self, template: OracleTemplate, message: &str) -> Self {
        self.push(template, Err(message.to_string()))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, template: OracleTemplate) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.template == template)
            .count()
    }

    fn push_plan(self, index: u64, reply: Reply) -> Self {
        self.plans
            .lock()
            .expect("plans lock")
            .entry(index)
            .or_default()
            .push_back(reply);
        self
    }

    fn push(self, template: OracleTemplate, reply: Reply) -> Self {
        self.queues
            .lock()
            .expect("queues lock")
            .entry(template)
            .or_default()
            .push_back(reply);
        self
    }
}

impl Oracle for ScriptedOracle {
    fn call(&self, request: &OracleRequest) -> Result<Value> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            template: request.template,
            label: request.label.clone(),
            variables: request.variables.clone(),
            temperature: request.temperature,
        });
        let reply = if request.template == OracleTemplate::Plan {
            let index = request.variables["candidate_index"].as_u64().unwrap_or(0);
            self.plans
                .lock()
                .expect("plans lock")
                .get_mut(&index)
                .and_then(VecDeque::pop_front)
        } else {
            self.queues
                .lock()
                .expect("queues lock")
                .get_mut(&request.template)
                .and_then(VecDeque::pop_front)
        };
        let value = reply
            .ok_or_else(|| anyhow!("no scripted {} reply for {}", request.template.as_str(), request.label))?
            .map_err(|message| anyhow!(message))?;
        fs::create_dir_all(&request.call_dir)?;
        fs::write(request.output_path(), serde_json::to_string_pretty(&value)?)?;
        Ok(value)
    }
}

/// Build a step from `(name, value)` pairs.
pub fn step(tool: &str, params: &[(&str, &str)]) -> Step {
    Step {
        tool: tool.to_string(),
        reasoning: format!("{tool} for test"),
        parameters: params
            .iter()
            .map(|(name, value)| Param {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
    }
}

pub fn step_json(tool: &str, params: &[(&str, &str)]) -> Value {
    serde_json::to_value(step(tool, params)).expect("step serializes")
}

pub fn plan_reply(steps: Vec<Value>) -> Value {
    json!({ "steps": steps })
}

pub fn select_reply(winner_index: i64) -> Value {
    json!({ "winner_index": winner_index, "rationale": "scripted" })
}

pub fn complete_reply(final_answer: &str) -> Value {
    json!({ "completed": true, "final_answer": final_answer, "next_steps": [] })
}

pub fn continue_reply(steps: Vec<Value>) -> Value {
    json!({ "completed": false, "final_answer": null, "next_steps": steps })
}

pub fn critic_ok() -> Value {
    json!({ "ok": true, "score": 8, "comment": "looks right", "patch": [] })
}

pub fn critic_block(comment: &str, patch: Vec<Value>) -> Value {
    json!({ "ok": false, "score": 1, "comment": comment, "patch": patch })
}

/// Executor over `workspace` with default limits and the standard registry.
pub fn executor(workspace: &Path) -> StepExecutor {
    let guard = PathGuard::new(workspace).expect("sandbox guard");
    let registry = ToolRegistry::standard().expect("standard registry");
    StepExecutor::new(registry, ToolContext::new(guard, ToolLimits::default()))
}

/// Run settings with one attempt per oracle call and no backoff.
pub fn settings(oracle_dir: &Path) -> RunSettings {
    RunSettings {
        max_turns: 10,
        max_oracle_calls: 22,
        plan_candidates: 1,
        base_temperature: 0.2,
        retry: RetryPolicy::no_retry(),
        oracle_timeout: Duration::from_secs(5),
        oracle_dir: oracle_dir.to_path_buf(),
        critic_enabled: false,
        safety_constraints: SafetyConstraint::ALL.into_iter().collect(),
        criteria: None,
    }
}
