//! Oracle abstraction for structured-output generation.
//!
//! The [`Oracle`] trait decouples orchestration from the backend that turns a
//! prompt into schema-conformant JSON (by default `codex exec`). Tests use
//! scripted oracles that return predetermined documents without spawning
//! processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::prompt::PromptEngine;

/// Which prompt an oracle call renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OracleTemplate {
    Plan,
    Select,
    Critic,
    Replan,
}

impl OracleTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleTemplate::Plan => "plan",
            OracleTemplate::Select => "select",
            OracleTemplate::Critic => "critic",
            OracleTemplate::Replan => "replan",
        }
    }
}

/// Parameters for one oracle attempt.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub template: OracleTemplate,
    /// Template variables (a JSON object).
    pub variables: Value,
    /// JSON Schema the output must satisfy.
    pub schema: Value,
    /// Stable call label, e.g. `plan-1` or `replan-t3`.
    pub label: String,
    /// Directory for this attempt's artifacts. Created if missing.
    pub call_dir: PathBuf,
    pub temperature: f32,
    pub timeout: Duration,
}

impl OracleRequest {
    pub fn output_path(&self) -> PathBuf {
        self.call_dir.join("output.json")
    }
}

/// Abstraction over oracle backends.
pub trait Oracle: Send + Sync {
    /// Produce a JSON document for `request`. Schema conformance is checked by the caller.
    fn call(&self, request: &OracleRequest) -> Result<Value>;
}

/// Oracle that renders the prompt and pipes it into an external command.
///
/// Argument placeholders `{schema}`, `{output}` and `{prompt}` expand to the
/// per-attempt artifact paths. The command may write its answer to `{output}`
/// or print it on stdout.
pub struct CommandOracle {
    argv: Vec<String>,
    prompts: PromptEngine,
    output_limit_bytes: usize,
}

impl CommandOracle {
    pub fn new(argv: Vec<String>, prompts: PromptEngine, output_limit_bytes: usize) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("oracle command must not be empty"));
        }
        Ok(Self {
            argv,
            prompts,
            output_limit_bytes,
        })
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(label = %request.label, template = request.template.as_str(), timeout_secs = request.timeout.as_secs()))]
    fn call(&self, request: &OracleRequest) -> Result<Value> {
        fs::create_dir_all(&request.call_dir)
            .with_context(|| format!("create oracle dir {}", request.call_dir.display()))?;

        let prompt = self.prompts.render(request.template, &request.variables)?;
        let schema_path = request.call_dir.join("schema.json");
        let prompt_path = request.call_dir.join("prompt.md");
        let output_path = request.output_path();
        let log_path = request.call_dir.join("oracle.log");

        let mut schema_buf = serde_json::to_string_pretty(&request.schema)?;
        schema_buf.push('\n');
        fs::write(&schema_path, schema_buf)
            .with_context(|| format!("write {}", schema_path.display()))?;
        fs::write(&prompt_path, &prompt)
            .with_context(|| format!("write {}", prompt_path.display()))?;

        let args: Vec<String> = self
            .argv
            .iter()
            .map(|arg| {
                arg.replace("{schema}", &schema_path.to_string_lossy())
                    .replace("{output}", &output_path.to_string_lossy())
                    .replace("{prompt}", &prompt_path.to_string_lossy())
            })
            .collect();
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..])
            .current_dir(&request.call_dir)
            .env("ORACLE_TEMPLATE", request.template.as_str())
            .env("ORACLE_LABEL", &request.label)
            .env("ORACLE_SCHEMA", &schema_path)
            .env("ORACLE_OUTPUT", &output_path)
            .env("ORACLE_TEMPERATURE", format!("{:.2}", request.temperature));

        info!(program = %args[0], "starting oracle command");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .context("run oracle command")?;
        write_oracle_log(&log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "oracle timed out");
            return Err(anyhow!("oracle timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "oracle command failed");
            return Err(anyhow!(
                "oracle command failed with status {:?}",
                output.status.code()
            ));
        }

        let value = load_output(&output_path, &output)?;
        debug!("oracle returned a json document");
        Ok(value)
    }
}

/// Read the answer from the output file, falling back to stdout.
fn load_output(output_path: &Path, output: &CommandOutput) -> Result<Value> {
    if output_path.exists() {
        let contents = fs::read_to_string(output_path)
            .with_context(|| format!("read oracle output {}", output_path.display()))?;
        return serde_json::from_str(contents.trim())
            .with_context(|| format!("parse {}", output_path.display()));
    }
    let stdout = output.stdout.text();
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Err(anyhow!("missing oracle output {}", output_path.display()));
    }
    let value: Value = serde_json::from_str(stdout).context("parse oracle stdout as json")?;
    let mut buf = serde_json::to_string_pretty(&value)?;
    buf.push('\n');
    fs::write(output_path, buf).with_context(|| format!("write {}", output_path.display()))?;
    Ok(value)
}

fn write_oracle_log(path: &Path, output: &CommandOutput) -> Result<()> {
    fs::write(path, output.transcript())
        .with_context(|| format!("write oracle log {}", path.display()))
}
