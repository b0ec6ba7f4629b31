//! Agent state persistence (`<run_dir>/state.json`).
//!
//! Every load and save is validated against the bundled state schema.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use crate::core::schemas::{self, AGENT_STATE_SCHEMA};
use crate::core::types::AgentState;

pub trait StateStore {
    fn load(&self) -> Result<AgentState>;
    fn save(&self, state: &AgentState) -> Result<()>;
    /// Where the state lives, for messages.
    fn location(&self) -> &Path;
}

/// State stored as pretty JSON, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
    schema: Value,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            path: path.into(),
            schema: schemas::load(AGENT_STATE_SCHEMA)?,
        })
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<AgentState> {
        debug!(path = %self.path.display(), "loading agent state");
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read state {}", self.path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse state {}", self.path.display()))?;
        schemas::validate(&self.schema, &value, "state")?;
        let state: AgentState = serde_json::from_value(value)
            .with_context(|| format!("deserialize state {}", self.path.display()))?;
        Ok(state)
    }

    fn save(&self, state: &AgentState) -> Result<()> {
        debug!(
            path = %self.path.display(),
            turn = state.current_turn,
            history = state.execution_history.len(),
            completed = state.completed,
            "writing agent state"
        );
        let value = serde_json::to_value(state).context("serialize state")?;
        schemas::validate(&self.schema, &value, "state")?;
        let mut buf = serde_json::to_string_pretty(&value)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{HistoryEntry, Param, Step, StepResult};

    fn sample_state() -> AgentState {
        let step = Step {
            tool: "write_file".to_string(),
            reasoning: "save".to_string(),
            parameters: vec![Param {
                name: "path".to_string(),
                value: "greeting.txt".to_string(),
            }],
        };
        let mut state = AgentState::new("write greeting");
        state.current_turn = 1;
        state.execution_history.push(HistoryEntry {
            turn: 1,
            step: step.clone(),
            result: StepResult::ok("wrote 13 bytes", 0),
        });
        state.next_steps.push(step);
        state
    }

    #[test]
    fn state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonStateStore::new(temp.path().join("state.json")).expect("store");
        let state = sample_state();
        store.save(&state).expect("save");
        assert_eq!(store.load().expect("load"), state);
        assert!(!temp.path().join("state.json.tmp").exists());
    }

    #[test]
    fn load_rejects_schema_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(
            &path,
            r#"{"task":"","completed":false,"current_turn":0,"next_steps":[],"execution_history":[],"final_answer":null,"error":null}"#,
        )
        .expect("seed");
        let store = JsonStateStore::new(&path).expect("store");
        let err = store.load().expect_err("empty task");
        assert!(err.to_string().contains("state schema validation failed"));
    }

    #[test]
    fn save_rejects_invalid_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonStateStore::new(temp.path().join("state.json")).expect("store");
        let mut state = sample_state();
        state.next_steps[0].parameters.clear();
        assert!(store.save(&state).is_err());
        assert!(!temp.path().join("state.json").exists());
    }
}
