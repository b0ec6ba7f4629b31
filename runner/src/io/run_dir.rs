//! Per-run directory layout.
//!
//! ```text
//! <sandbox_root>/<run_id>/
//!   workspace/     tool sandbox (PathGuard root)
//!   state.json     persisted AgentState
//!   run.log        per-run event log
//!   oracle/        per-call artifacts
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};

/// Paths of one run. Every run gets a fresh, uniquely named directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub state: PathBuf,
    pub log: PathBuf,
    pub oracle: PathBuf,
}

impl RunPaths {
    fn new(run_id: String, root: PathBuf) -> Self {
        Self {
            workspace: root.join("workspace"),
            state: root.join("state.json"),
            log: root.join("run.log"),
            oracle: root.join("oracle"),
            run_id,
            root,
        }
    }
}

/// Create a new run directory under `sandbox_root`.
pub fn create_run(sandbox_root: &Path) -> Result<RunPaths> {
    fs::create_dir_all(sandbox_root)
        .with_context(|| format!("create sandbox root {}", sandbox_root.display()))?;
    let sandbox_root = sandbox_root
        .canonicalize()
        .with_context(|| format!("canonicalize {}", sandbox_root.display()))?;

    let run_id = build_run_id(&generate_timestamp(), &generate_short_id());
    let root = sandbox_root.join(&run_id);
    if root.exists() {
        bail!("run directory already exists: {}", root.display());
    }
    let paths = RunPaths::new(run_id, root);
    fs::create_dir_all(&paths.workspace)
        .with_context(|| format!("create workspace {}", paths.workspace.display()))?;
    fs::create_dir_all(&paths.oracle)
        .with_context(|| format!("create oracle dir {}", paths.oracle.display()))?;
    Ok(paths)
}

pub fn build_run_id(timestamp: &str, short_id: &str) -> String {
    format!("run-{timestamp}-{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_format() {
        assert_eq!(
            build_run_id("20260101_120000", "abc123"),
            "run-20260101_120000-abc123"
        );
    }

    #[test]
    fn runs_get_distinct_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = create_run(temp.path()).expect("first");
        let second = create_run(temp.path()).expect("second");
        assert_ne!(first.root, second.root);
        assert!(first.workspace.is_dir());
        assert!(first.oracle.is_dir());
        assert!(first.run_id.starts_with("run-"));
        assert_eq!(first.state, first.root.join("state.json"));
    }
}
