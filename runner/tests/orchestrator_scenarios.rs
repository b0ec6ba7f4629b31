//! End-to-end orchestrator scenarios against a scripted oracle.
//!
//! Each test runs a full `Orchestrator::run` inside a temp directory with the
//! real tool registry and state store, and checks both the outcome and the
//! state left on disk.

use std::fs;

use anyhow::Result;
use tempfile::TempDir;

use taskrunner::core::errors::{FailureKind, PathEscapeError};
use taskrunner::core::phase::RunPhase;
use taskrunner::core::types::AgentState;
use taskrunner::io::oracle::OracleTemplate;
use taskrunner::io::run_state::{JsonStateStore, StateStore};
use taskrunner::orchestrator::{Orchestrator, RunOutcome, RunSettings};
use taskrunner::test_support::{
    ScriptedOracle, complete_reply, continue_reply, critic_block, critic_ok, executor, plan_reply,
    select_reply, settings, step_json,
};

struct Finished {
    temp: TempDir,
    result: Result<RunOutcome>,
    phase: RunPhase,
    state: AgentState,
}

fn run(oracle: &ScriptedOracle, task: &str, tweak: impl FnOnce(&mut RunSettings)) -> Finished {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut run_settings = settings(&temp.path().join("oracle"));
    tweak(&mut run_settings);
    let store = JsonStateStore::new(temp.path().join("state.json")).expect("store");
    let mut orchestrator = Orchestrator::new(
        oracle,
        executor(&temp.path().join("workspace")),
        store,
        run_settings,
    )
    .expect("orchestrator");
    let result = orchestrator.run(task);
    let phase = orchestrator.phase();
    let state = JsonStateStore::new(temp.path().join("state.json"))
        .expect("store")
        .load()
        .expect("persisted state");
    Finished {
        temp,
        result,
        phase,
        state,
    }
}

fn write_greeting(path: &str) -> serde_json::Value {
    step_json("write_file", &[("path", path), ("content", "Hello, World!")])
}

#[test]
fn greeting_task_completes_in_one_turn() {
    let oracle = ScriptedOracle::new()
        .plan(0, plan_reply(vec![write_greeting("greeting.txt")]))
        .reply(
            OracleTemplate::Replan,
            complete_reply("Created greeting.txt containing 'Hello, World!'"),
        );
    let finished = run(
        &oracle,
        "create greeting.txt containing 'Hello, World!'",
        |_| {},
    );

    let outcome = finished.result.expect("run completes");
    assert!(outcome.final_answer.contains("greeting.txt"));
    assert_eq!(outcome.turns, 1);
    assert_eq!(outcome.oracle_calls, 2);
    assert_eq!(finished.phase, RunPhase::Completed);
    assert_eq!(
        fs::read_to_string(finished.temp.path().join("workspace/greeting.txt")).expect("file"),
        "Hello, World!"
    );

    let state = finished.state;
    assert!(state.completed);
    assert_eq!(state.current_turn, 1);
    assert_eq!(state.execution_history.len(), 1);
    assert!(state.execution_history[0].result.success);
    assert!(state.next_steps.is_empty());
    assert!(state.error.is_none());
    assert!(
        finished
            .temp
            .path()
            .join("oracle/plan-0/attempt-1/output.json")
            .exists()
    );
}

#[test]
fn critic_patch_replaces_escaping_step() {
    let oracle = ScriptedOracle::new()
        .plan(0, plan_reply(vec![write_greeting("../outside.txt")]))
        .reply(
            OracleTemplate::Critic,
            critic_block(
                "path leaves the sandbox",
                vec![write_greeting("inside.txt")],
            ),
        )
        .reply(OracleTemplate::Replan, complete_reply("wrote inside.txt"));
    let finished = run(&oracle, "write a greeting", |s| s.critic_enabled = true);

    finished.result.expect("run completes");
    assert!(finished.temp.path().join("workspace/inside.txt").exists());
    assert!(!finished.temp.path().join("outside.txt").exists());
    let history = &finished.state.execution_history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].step.param("path"), Some("inside.txt"));
    assert!(history[0].result.success);
    // The patch ran without a second review.
    assert_eq!(oracle.count(OracleTemplate::Critic), 1);
}

#[test]
fn escaping_step_without_critic_is_fatal() {
    let oracle = ScriptedOracle::new().plan(0, plan_reply(vec![write_greeting("../outside.txt")]));
    let finished = run(&oracle, "write a greeting", |_| {});

    let err = finished.result.expect_err("escape is fatal");
    assert!(err.downcast_ref::<PathEscapeError>().is_some());
    assert_eq!(FailureKind::classify(&err), FailureKind::PathEscape);
    assert_eq!(finished.phase, RunPhase::Failed);
    assert!(!finished.temp.path().join("outside.txt").exists());
    let error = finished.state.error.expect("error recorded");
    assert!(error.starts_with("path_escape:"));
    assert_eq!(oracle.count(OracleTemplate::Replan), 0);
}

#[test]
fn duplicate_candidates_collapse_before_selection() {
    let plan_a = plan_reply(vec![write_greeting("a.txt")]);
    let plan_b = plan_reply(vec![write_greeting("b.txt")]);
    let oracle = ScriptedOracle::new()
        .plan(0, plan_a.clone())
        .plan(1, plan_b)
        .plan(2, plan_a)
        .reply(OracleTemplate::Select, select_reply(1))
        .reply(OracleTemplate::Replan, complete_reply("wrote b.txt"));
    let finished = run(&oracle, "write a greeting", |s| s.plan_candidates = 3);

    let outcome = finished.result.expect("run completes");
    assert_eq!(outcome.surviving_candidates, 3);
    assert_eq!(outcome.unique_candidates, 2);
    assert_eq!(outcome.plan_candidate, 1);
    assert_eq!(
        finished.state.execution_history[0].step.param("path"),
        Some("b.txt")
    );

    let select = oracle
        .calls()
        .into_iter()
        .find(|call| call.template == OracleTemplate::Select)
        .expect("selector called");
    assert_eq!(select.variables["candidates"].as_array().map(Vec::len), Some(2));

    let mut temperatures: Vec<f32> = oracle
        .calls()
        .iter()
        .filter(|call| call.template == OracleTemplate::Plan)
        .map(|call| call.temperature)
        .collect();
    temperatures.sort_by(f32::total_cmp);
    assert_eq!(temperatures.len(), 3);
    assert!((temperatures[2] - temperatures[0] - 0.4).abs() < 1e-5);
}

#[test]
fn selector_failure_falls_back_to_first_candidate() {
    let oracle = ScriptedOracle::new()
        .plan(0, plan_reply(vec![write_greeting("a.txt")]))
        .plan(1, plan_reply(vec![write_greeting("b.txt")]))
        .failure(OracleTemplate::Select, "selector offline")
        .reply(OracleTemplate::Replan, complete_reply("wrote a.txt"));
    let finished = run(&oracle, "write a greeting", |s| s.plan_candidates = 2);

    let outcome = finished.result.expect("run completes");
    assert_eq!(outcome.plan_candidate, 0);
    assert!(finished.temp.path().join("workspace/a.txt").exists());
}

#[test]
fn failed_and_empty_candidates_are_dropped() {
    let oracle = ScriptedOracle::new()
        .plan_failure(0, "timeout")
        .plan(1, plan_reply(vec![serde_json::json!({})]))
        .plan(2, plan_reply(vec![write_greeting("c.txt")]))
        .reply(OracleTemplate::Replan, complete_reply("wrote c.txt"));
    let finished = run(&oracle, "write a greeting", |s| s.plan_candidates = 3);

    let outcome = finished.result.expect("run completes");
    assert_eq!(outcome.plan_candidate, 2);
    assert_eq!(outcome.surviving_candidates, 1);
    assert_eq!(outcome.unique_candidates, 1);
    assert_eq!(oracle.count(OracleTemplate::Select), 0);
}

#[test]
fn no_surviving_candidate_is_fatal() {
    let oracle = ScriptedOracle::new()
        .plan_failure(0, "timeout")
        .plan_failure(1, "refused");
    let finished = run(&oracle, "write a greeting", |s| s.plan_candidates = 2);

    let err = finished.result.expect_err("no plan");
    assert_eq!(FailureKind::classify(&err), FailureKind::NoValidPlan);
    assert!(finished.state.error.expect("error").starts_with("no_valid_plan:"));
}

#[test]
fn turn_budget_halts_with_last_state() {
    let oracle = ScriptedOracle::new()
        .plan(0, plan_reply(vec![write_greeting("a.txt")]))
        .reply(
            OracleTemplate::Replan,
            continue_reply(vec![write_greeting("b.txt")]),
        )
        .reply(
            OracleTemplate::Replan,
            continue_reply(vec![write_greeting("c.txt")]),
        );
    let finished = run(&oracle, "keep writing", |s| s.max_turns = 2);

    let err = finished.result.expect_err("budget");
    assert_eq!(FailureKind::classify(&err), FailureKind::BudgetExceeded);
    assert!(err.to_string().contains("turn budget exceeded"));

    let state = finished.state;
    assert_eq!(state.current_turn, 2);
    let turns: Vec<u32> = state.execution_history.iter().map(|e| e.turn).collect();
    assert_eq!(turns, vec![1, 2]);
    // The last good plan is kept for postmortem.
    assert_eq!(state.next_steps[0].param("path"), Some("c.txt"));
    assert!(state.error.expect("error").starts_with("budget_exceeded:"));
    assert!(!finished.temp.path().join("workspace/c.txt").exists());
}

#[test]
fn call_budget_refuses_before_issuing() {
    let oracle = ScriptedOracle::new()
        .plan(0, plan_reply(vec![write_greeting("a.txt")]))
        .reply(
            OracleTemplate::Replan,
            continue_reply(vec![write_greeting("b.txt")]),
        )
        .reply(OracleTemplate::Replan, complete_reply("never reached"));
    let finished = run(&oracle, "keep writing", |s| s.max_oracle_calls = 2);

    let err = finished.result.expect_err("budget");
    assert_eq!(FailureKind::classify(&err), FailureKind::BudgetExceeded);
    assert!(err.to_string().contains("oracle call budget exceeded"));
    assert_eq!(oracle.calls().len(), 2);
    assert_eq!(finished.state.current_turn, 2);
    assert!(!finished.state.completed);
}

#[test]
fn tool_failures_feed_the_replanner() {
    let oracle = ScriptedOracle::new()
        .plan(
            0,
            plan_reply(vec![
                step_json("delete_everything", &[("path", ".")]),
                step_json("read_file", &[("path", "missing.txt")]),
            ]),
        )
        .reply(
            OracleTemplate::Replan,
            continue_reply(vec![write_greeting("missing.txt")]),
        )
        .reply(OracleTemplate::Replan, complete_reply("created missing.txt"));
    let finished = run(&oracle, "make missing.txt exist", |_| {});

    let outcome = finished.result.expect("run completes");
    assert_eq!(outcome.turns, 2);
    let history = &finished.state.execution_history;
    assert_eq!(history.len(), 3);
    assert!(!history[0].result.success);
    assert!(!history[1].result.success);
    assert!(history[2].result.success);

    let first_replan = oracle
        .calls()
        .into_iter()
        .find(|call| call.template == OracleTemplate::Replan)
        .expect("replan call");
    let rendered_history = first_replan.variables["history"].as_str().expect("history");
    assert!(rendered_history.contains("delete_everything"));
    assert!(rendered_history.contains("failed"));
}

#[test]
fn critic_block_and_outage_record_failures() {
    let oracle = ScriptedOracle::new()
        .plan(
            0,
            plan_reply(vec![write_greeting("a.txt"), write_greeting("b.txt"), write_greeting("c.txt")]),
        )
        .reply(OracleTemplate::Critic, critic_block("pointless", Vec::new()))
        .failure(OracleTemplate::Critic, "critic timed out")
        .reply(OracleTemplate::Critic, critic_ok())
        .reply(OracleTemplate::Replan, complete_reply("wrote c.txt"));
    let finished = run(&oracle, "write greetings", |s| s.critic_enabled = true);

    finished.result.expect("run completes");
    let history = &finished.state.execution_history;
    assert_eq!(history.len(), 3);
    assert_eq!(
        history[0].result.error.as_deref(),
        Some("blocked by critic: pointless")
    );
    assert!(
        history[1]
            .result
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("critic unavailable:"))
    );
    assert!(history[2].result.success);
    let workspace = finished.temp.path().join("workspace");
    assert!(!workspace.join("a.txt").exists());
    assert!(!workspace.join("b.txt").exists());
    assert!(workspace.join("c.txt").exists());
}

#[test]
fn replanner_exhaustion_is_fatal() {
    let oracle = ScriptedOracle::new()
        .plan(0, plan_reply(vec![write_greeting("a.txt")]))
        .reply(
            OracleTemplate::Replan,
            serde_json::json!({"completed": true, "final_answer": "", "next_steps": []}),
        );
    let finished = run(&oracle, "write a greeting", |_| {});

    let err = finished.result.expect_err("exhausted");
    assert_eq!(FailureKind::classify(&err), FailureKind::OracleExhausted);
    assert!(format!("{err:#}").contains("final_answer"));
    assert!(finished.state.error.expect("error").starts_with("oracle_exhausted:"));
}

#[test]
fn verification_is_advisory() {
    let oracle = ScriptedOracle::new()
        .plan(0, plan_reply(vec![write_greeting("greeting.txt")]))
        .reply(OracleTemplate::Replan, complete_reply("done"));
    let criteria = serde_json::json!([
        {"type": "file_contains", "path": "greeting.txt", "substr": "Hello"},
        {"type": "file_exists", "path": "report.md"}
    ]);
    let finished = run(&oracle, "write a greeting", |s| s.criteria = Some(criteria));

    let outcome = finished.result.expect("replanner decides completion");
    let verification = outcome.verification.expect("verification ran");
    assert_eq!(verification.status.as_str(), "some_failed");
    assert!(verification.outcomes[0].passed);
    assert!(!verification.outcomes[1].passed);

    let plan_call = &oracle.calls()[0];
    assert!(
        plan_call.variables["criteria"]
            .as_str()
            .is_some_and(|c| c.contains("report.md"))
    );
}
