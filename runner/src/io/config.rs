//! Runner configuration (`taskrunner.toml`).

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::{Backoff, RetryPolicy};
use crate::core::types::SafetyConstraint;
use crate::io::tools::ToolLimits;

pub const DEFAULT_CONFIG_FILE: &str = "taskrunner.toml";

/// Runner configuration (TOML).
///
/// Every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory that holds one subdirectory per run.
    pub sandbox_root: PathBuf,
    pub max_turns: u32,
    /// Hard ceiling on oracle calls across the whole run, retries included.
    pub max_oracle_calls: u32,
    /// Plan candidates generated in parallel before the first turn.
    pub plan_candidates: u32,
    /// Temperature of candidate 0; each later candidate adds 0.2.
    pub base_temperature: f32,
    /// Rendered prompts over this size drop optional sections.
    pub prompt_budget_bytes: usize,
    pub oracle: OracleConfig,
    pub retry: RetryConfig,
    pub limits: LimitsConfig,
    pub critic: CriticConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command argv. `{schema}`, `{output}` and `{prompt}` are replaced per call.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate oracle stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Double the delay after each failed attempt, up to `max_backoff_ms`.
    pub exponential: bool,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub file_bytes: u64,
    pub download_bytes: u64,
    pub file_timeout_secs: u64,
    pub network_timeout_secs: u64,
    pub replace_max_hits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CriticConfig {
    pub enabled: bool,
    pub safety_constraints: BTreeSet<SafetyConstraint>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from(".taskrunner/runs"),
            max_turns: 10,
            max_oracle_calls: 22,
            plan_candidates: 3,
            base_temperature: 0.2,
            prompt_budget_bytes: 200_000,
            oracle: OracleConfig::default(),
            retry: RetryConfig::default(),
            limits: LimitsConfig::default(),
            critic: CriticConfig::default(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: [
                "codex",
                "exec",
                "--skip-git-repo-check",
                "--output-schema",
                "{schema}",
                "--output-last-message",
                "{output}",
                "-",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 2_000,
            exponential: false,
            max_backoff_ms: 30_000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = ToolLimits::default();
        Self {
            file_bytes: limits.file_bytes,
            download_bytes: limits.download_bytes,
            file_timeout_secs: limits.file_timeout.as_secs(),
            network_timeout_secs: limits.network_timeout.as_secs(),
            replace_max_hits: limits.replace_max_hits,
        }
    }
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            safety_constraints: SafetyConstraint::ALL.into_iter().collect(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_turns == 0 {
            return Err(anyhow!("max_turns must be > 0"));
        }
        if self.max_oracle_calls == 0 {
            return Err(anyhow!("max_oracle_calls must be > 0"));
        }
        if self.plan_candidates == 0 {
            return Err(anyhow!("plan_candidates must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.base_temperature) {
            return Err(anyhow!("base_temperature must be within 0.0..=2.0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle.output_limit_bytes must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.limits.file_bytes == 0 || self.limits.download_bytes == 0 {
            return Err(anyhow!("limits.file_bytes and limits.download_bytes must be > 0"));
        }
        if self.limits.file_timeout_secs == 0 || self.limits.network_timeout_secs == 0 {
            return Err(anyhow!("limits timeouts must be > 0"));
        }
        if self.limits.replace_max_hits == 0 {
            return Err(anyhow!("limits.replace_max_hits must be > 0"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = if self.retry.exponential {
            Backoff::Exponential {
                base_ms: self.retry.backoff_ms,
                max_ms: self.retry.max_backoff_ms.max(self.retry.backoff_ms),
            }
        } else {
            Backoff::Fixed {
                delay_ms: self.retry.backoff_ms,
            }
        };
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            backoff,
        }
    }

    pub fn tool_limits(&self) -> ToolLimits {
        ToolLimits {
            file_bytes: self.limits.file_bytes,
            download_bytes: self.limits.download_bytes,
            file_timeout: Duration::from_secs(self.limits.file_timeout_secs),
            network_timeout: Duration::from_secs(self.limits.network_timeout_secs),
            replace_max_hits: self.limits.replace_max_hits,
            block_internal_ips: self
                .critic
                .safety_constraints
                .contains(&SafetyConstraint::NoNetworkInternalIps),
        }
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle.timeout_secs)
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub sandbox_root: Option<PathBuf>,
    pub max_turns: Option<u32>,
    pub max_oracle_calls: Option<u32>,
    pub plan_candidates: Option<u32>,
    pub critic: Option<bool>,
}

impl ConfigOverrides {
    /// Apply overrides and re-validate the merged config.
    pub fn apply(&self, mut cfg: RunnerConfig) -> Result<RunnerConfig> {
        if let Some(root) = &self.sandbox_root {
            cfg.sandbox_root = root.clone();
        }
        if let Some(max_turns) = self.max_turns {
            cfg.max_turns = max_turns;
        }
        if let Some(max_calls) = self.max_oracle_calls {
            cfg.max_oracle_calls = max_calls;
        }
        if let Some(candidates) = self.plan_candidates {
            cfg.plan_candidates = candidates;
        }
        if let Some(enabled) = self.critic {
            cfg.critic.enabled = enabled;
        }
        cfg.validate().context("invalid config after command-line overrides")?;
        Ok(cfg)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
        assert_eq!(cfg.max_turns, 10);
        assert_eq!(cfg.max_oracle_calls, 22);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("taskrunner.toml");
        let mut cfg = RunnerConfig::default();
        cfg.critic.enabled = true;
        cfg.retry.exponential = true;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("taskrunner.toml");
        fs::write(
            &path,
            "max_turns = 4\n[critic]\nenabled = true\nsafety_constraints = [\"no_system_commands\"]\n",
        )
        .expect("seed");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_turns, 4);
        assert_eq!(cfg.max_oracle_calls, 22);
        assert!(cfg.critic.enabled);
        assert_eq!(cfg.critic.safety_constraints.len(), 1);
        assert!(!cfg.tool_limits().block_internal_ips);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("taskrunner.toml");
        fs::write(&path, "max_turns = 0\n").expect("seed");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("max_turns must be > 0"));
    }

    #[test]
    fn overrides_win_and_are_validated() {
        let overrides = ConfigOverrides {
            max_turns: Some(2),
            critic: Some(true),
            ..ConfigOverrides::default()
        };
        let cfg = overrides.apply(RunnerConfig::default()).expect("apply");
        assert_eq!(cfg.max_turns, 2);
        assert!(cfg.critic.enabled);

        let bad = ConfigOverrides {
            plan_candidates: Some(0),
            ..ConfigOverrides::default()
        };
        assert!(bad.apply(RunnerConfig::default()).is_err());
    }

    #[test]
    fn retry_policy_follows_config() {
        let mut cfg = RunnerConfig::default();
        assert_eq!(cfg.retry_policy(), RetryPolicy::fixed(3, Duration::from_secs(2)));
        cfg.retry.exponential = true;
        assert!(matches!(
            cfg.retry_policy().backoff,
            Backoff::Exponential { base_ms: 2_000, max_ms: 30_000 }
        ));
    }
}
