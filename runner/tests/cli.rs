//! CLI tests for `taskrunner`.
//!
//! Spawns the binary and checks exit codes and on-disk artifacts. `run`
//! tests use a small `sh` script as the oracle command.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use taskrunner::exit_codes;

fn taskrunner(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_taskrunner"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("spawn taskrunner")
}

fn write_criteria(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("criteria.json");
    fs::write(&path, contents).expect("write criteria");
    path
}

#[test]
fn verify_exit_codes_follow_status() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = temp.path().join("sandbox");
    fs::create_dir_all(&sandbox).expect("sandbox");
    fs::write(sandbox.join("greeting.txt"), "Hello, World!").expect("seed");
    let sandbox_arg = sandbox.to_str().expect("utf8 path");

    let cases = [
        (r#"[{"type":"file_contains","path":"greeting.txt","substr":"World"}]"#, 0),
        (r#"[{"type":"file_exists","path":"missing.txt"}]"#, 1),
        (r#"[{"type":"url_ok","url":"https://example.com"}]"#, 2),
        (r#"{"type":"file_exists","path":"greeting.txt"}"#, 3),
        ("[]", 3),
    ];
    for (criteria, expected) in cases {
        let path = write_criteria(temp.path(), criteria);
        let output = taskrunner(
            temp.path(),
            &["verify", "--sandbox", sandbox_arg, path.to_str().expect("utf8 path")],
        );
        assert_eq!(output.status.code(), Some(expected), "criteria {criteria}");
    }

    let output = taskrunner(
        temp.path(),
        &["verify", "--sandbox", sandbox_arg, "no-such-criteria.json"],
    );
    assert_eq!(output.status.code(), Some(4));
}

#[test]
fn tools_lists_every_catalog_entry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = taskrunner(temp.path(), &["tools"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in taskrunner::core::catalog::tool_names() {
        assert!(stdout.contains(name), "missing {name}");
    }
    assert!(stdout.contains("limits:"));
}

#[test]
fn init_config_refuses_to_overwrite_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = taskrunner(temp.path(), &["init-config"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    assert!(temp.path().join("taskrunner.toml").exists());

    let second = taskrunner(temp.path(), &["init-config"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));

    let forced = taskrunner(temp.path(), &["init-config", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn invalid_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("taskrunner.toml"), "max_turns = 0\n").expect("config");
    let output = taskrunner(temp.path(), &["run", "say", "hi"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_turns"));
}

#[cfg(unix)]
mod run {
    use super::*;

    const PLAN: &str = r#"{"steps":[{"tool":"write_file","reasoning":"create the file","parameters":[{"name":"path","value":"greeting.txt"},{"name":"content","value":"Hello, World!"}]}]}"#;
    const COMPLETE: &str = r#"{"completed":true,"final_answer":"Created greeting.txt","next_steps":[]}"#;
    const CONTINUE: &str = r#"{"completed":false,"final_answer":null,"next_steps":[{"tool":"read_file","reasoning":"check","parameters":[{"name":"path","value":"greeting.txt"}]}]}"#;

    /// Write an oracle script and a config pointing at it.
    fn setup(dir: &Path, replan_reply: &str) {
        let script = dir.join("oracle.sh");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\ncat > /dev/null\ncase \"$ORACLE_TEMPLATE\" in\n  plan) printf '%s' '{PLAN}' > \"$ORACLE_OUTPUT\" ;;\n  replan) printf '%s' '{replan_reply}' > \"$ORACLE_OUTPUT\" ;;\n  *) exit 1 ;;\nesac\n"
            ),
        )
        .expect("script");
        let config = format!(
            "sandbox_root = {:?}\nplan_candidates = 1\n\n[oracle]\ncommand = [\"sh\", {:?}]\ntimeout_secs = 30\n\n[retry]\nmax_attempts = 1\nbackoff_ms = 0\n",
            dir.join("runs").display().to_string(),
            script.display().to_string(),
        );
        fs::write(dir.join("taskrunner.toml"), config).expect("config");
    }

    fn only_run_dir(dir: &Path) -> PathBuf {
        let runs: Vec<PathBuf> = fs::read_dir(dir.join("runs"))
            .expect("runs dir")
            .map(|entry| entry.expect("entry").path())
            .collect();
        assert_eq!(runs.len(), 1);
        runs.into_iter().next().expect("run dir")
    }

    #[test]
    fn run_completes_and_leaves_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup(temp.path(), COMPLETE);

        let output = taskrunner(
            temp.path(),
            &["run", "create", "greeting.txt", "containing", "'Hello, World!'"],
        );
        assert_eq!(
            output.status.code(),
            Some(exit_codes::OK),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert!(String::from_utf8_lossy(&output.stdout).contains("Created greeting.txt"));
        assert!(String::from_utf8_lossy(&output.stderr).contains("(1 survived, 1 unique)"));

        let run_dir = only_run_dir(temp.path());
        let name = run_dir.file_name().expect("name").to_string_lossy().to_string();
        assert!(name.starts_with("run-"));
        assert_eq!(
            fs::read_to_string(run_dir.join("workspace/greeting.txt")).expect("greeting"),
            "Hello, World!"
        );
        let state: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(run_dir.join("state.json")).expect("state"))
                .expect("state json");
        assert_eq!(state["completed"], true);
        assert_eq!(state["current_turn"], 1);

        let log = fs::read_to_string(run_dir.join("run.log")).expect("run log");
        assert!(log.contains("INFO"));
        assert!(log.contains("phase transition"));
        assert!(run_dir.join("oracle/plan-0/attempt-1/prompt.md").exists());
        assert!(run_dir.join("oracle/replan-t1/attempt-1/oracle.log").exists());
    }

    #[test]
    fn run_out_of_turns_exits_with_budget_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup(temp.path(), CONTINUE);

        let output = taskrunner(temp.path(), &["run", "--max-turns", "2", "loop", "forever"]);
        assert_eq!(output.status.code(), Some(exit_codes::BUDGET_EXCEEDED));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("budget_exceeded"));
        assert!(stderr.contains("state.json"));

        let run_dir = only_run_dir(temp.path());
        let state: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(run_dir.join("state.json")).expect("state"))
                .expect("state json");
        assert_eq!(state["current_turn"], 2);
        assert!(
            state["error"]
                .as_str()
                .is_some_and(|e| e.starts_with("budget_exceeded"))
        );
    }

    #[test]
    fn oracle_failure_exits_with_no_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup(temp.path(), COMPLETE);
        fs::write(temp.path().join("oracle.sh"), "#!/bin/sh\nexit 7\n").expect("script");

        let output = taskrunner(temp.path(), &["run", "anything"]);
        assert_eq!(output.status.code(), Some(exit_codes::NO_PROGRESS));
        assert!(String::from_utf8_lossy(&output.stderr).contains("no_valid_plan"));
    }
}
