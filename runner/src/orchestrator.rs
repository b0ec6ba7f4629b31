//! The turn loop.
//!
//! One control thread drives a run through `Init → Planning → Executing →
//! (Critiquing) → Replanning → …` until the replanner reports completion or
//! a hard budget runs out. State is saved after every mutation; a failed run
//! leaves its last good state on disk with `error` set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::budget::{CallBudget, next_turn};
use crate::core::critic_signals::CriticContext;
use crate::core::errors::FailureKind;
use crate::core::phase::RunPhase;
use crate::core::retry::RetryPolicy;
use crate::core::types::{AgentState, HistoryEntry, ReplanDecision, SafetyConstraint, Step, StepResult};
use crate::critic::{Critic, Verdict};
use crate::gateway::OracleGateway;
use crate::io::config::RunnerConfig;
use crate::io::oracle::Oracle;
use crate::io::run_state::StateStore;
use crate::io::tools::StepExecutor;
use crate::planner::{PlanSettings, SelectedPlan, generate_plan};
use crate::replan::Replanner;
use crate::verify::{Verification, VerifyStatus, criteria_paths, verify_success};

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_turns: u32,
    pub max_oracle_calls: u32,
    pub plan_candidates: usize,
    pub base_temperature: f32,
    pub retry: RetryPolicy,
    pub oracle_timeout: Duration,
    /// Root of the per-call artifact directories.
    pub oracle_dir: PathBuf,
    pub critic_enabled: bool,
    pub safety_constraints: BTreeSet<SafetyConstraint>,
    /// Verification criteria (a JSON array), advisory.
    pub criteria: Option<Value>,
}

impl RunSettings {
    pub fn from_config(cfg: &RunnerConfig, oracle_dir: &Path, criteria: Option<Value>) -> Self {
        Self {
            max_turns: cfg.max_turns,
            max_oracle_calls: cfg.max_oracle_calls,
            plan_candidates: cfg.plan_candidates as usize,
            base_temperature: cfg.base_temperature,
            retry: cfg.retry_policy(),
            oracle_timeout: cfg.oracle_timeout(),
            oracle_dir: oracle_dir.to_path_buf(),
            critic_enabled: cfg.critic.enabled,
            safety_constraints: cfg.critic.safety_constraints.clone(),
            criteria,
        }
    }
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_answer: String,
    pub turns: u32,
    pub oracle_calls: u32,
    /// Index of the generating call of the chosen plan.
    pub plan_candidate: usize,
    /// Candidates left after failed and empty ones were dropped.
    pub surviving_candidates: usize,
    pub unique_candidates: usize,
    pub verification: Option<Verification>,
    pub state: AgentState,
}

pub struct Orchestrator<'a, S: StateStore> {
    oracle: &'a dyn Oracle,
    budget: CallBudget,
    executor: StepExecutor,
    store: S,
    settings: RunSettings,
    phase: RunPhase,
    critic: Option<Critic>,
    replanner: Replanner,
    criteria_text: Option<String>,
    expected_paths: Vec<String>,
}

impl<'a, S: StateStore> Orchestrator<'a, S> {
    pub fn new(
        oracle: &'a dyn Oracle,
        executor: StepExecutor,
        store: S,
        settings: RunSettings,
    ) -> Result<Self> {
        let criteria_text = settings
            .criteria
            .as_ref()
            .map(serde_json::to_string_pretty)
            .transpose()?;
        let expected_paths = settings
            .criteria
            .as_ref()
            .map(criteria_paths)
            .unwrap_or_default();
        let critic = if settings.critic_enabled {
            Some(Critic::new(settings.base_temperature)?)
        } else {
            None
        };
        let replanner = Replanner::new(
            settings.max_turns,
            settings.base_temperature,
            criteria_text.clone(),
        )?;
        Ok(Self {
            oracle,
            budget: CallBudget::new(settings.max_oracle_calls),
            executor,
            store,
            settings,
            phase: RunPhase::Init,
            critic,
            replanner,
            criteria_text,
            expected_paths,
        })
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn oracle_calls(&self) -> u32 {
        self.budget.used()
    }

    /// Run `task` to completion.
    ///
    /// Errors are the typed fatal errors of [`crate::core::errors`] (wrapped
    /// in `anyhow`); the persisted state carries the same classification.
    #[instrument(skip_all, fields(max_turns = self.settings.max_turns, max_oracle_calls = self.settings.max_oracle_calls))]
    pub fn run(&mut self, task: &str) -> Result<RunOutcome> {
        let task = task.trim();
        if task.is_empty() {
            bail!("task must not be empty");
        }
        let mut state = AgentState::new(task);
        self.store.save(&state)?;
        match self.drive(&mut state) {
            Ok((final_answer, plan)) => {
                let verification = self.verify();
                Ok(RunOutcome {
                    final_answer,
                    turns: state.current_turn,
                    oracle_calls: self.budget.used(),
                    plan_candidate: plan.candidate.index,
                    surviving_candidates: plan.survived,
                    unique_candidates: plan.unique,
                    verification,
                    state,
                })
            }
            Err(err) => Err(self.fail(&mut state, err)),
        }
    }

    fn drive(&mut self, state: &mut AgentState) -> Result<(String, SelectedPlan)> {
        self.advance(RunPhase::Planning)?;
        let plan = generate_plan(
            &self.gateway(),
            &PlanSettings {
                task: &state.task,
                candidates: self.settings.plan_candidates,
                base_temperature: self.settings.base_temperature,
                file_limit_bytes: self.executor.context().limits.file_bytes,
                criteria: self.criteria_text.as_deref(),
            },
        )?;
        state.next_steps = plan.candidate.steps.clone();
        self.store.save(state)?;

        loop {
            if state.completed {
                let answer = state.final_answer.clone().unwrap_or_default();
                info!(turns = state.current_turn, answer = %answer, "task completed");
                return Ok((answer, plan));
            }
            let turn = next_turn(state.current_turn, self.settings.max_turns)?;
            state.current_turn = turn;
            self.store.save(state)?;
            info!(
                turn,
                steps = state.next_steps.len(),
                calls_used = self.budget.used(),
                "turn started"
            );

            self.advance(RunPhase::Executing)?;
            self.execute_turn(state)?;

            self.advance(RunPhase::Replanning)?;
            match self.replanner.replan(&self.gateway(), state)? {
                ReplanDecision::Complete { final_answer } => {
                    state.completed = true;
                    state.final_answer = Some(final_answer);
                    state.next_steps.clear();
                    self.store.save(state)?;
                    self.advance(RunPhase::Completed)?;
                }
                ReplanDecision::Continue { next_steps } => {
                    info!(turn, next_steps = next_steps.len(), "replanned");
                    state.next_steps = next_steps;
                    self.store.save(state)?;
                }
            }
        }
    }

    /// Execute the planned steps of the current turn in order.
    fn execute_turn(&mut self, state: &mut AgentState) -> Result<()> {
        let plan = std::mem::take(&mut state.next_steps);
        for (position, step) in plan.iter().enumerate() {
            let upcoming = &plan[position + 1..];
            state.next_steps = upcoming.to_vec();
            if self.critic.is_none() {
                self.run_step(state, step)?;
                continue;
            }

            self.advance(RunPhase::Critiquing)?;
            let verdict = self.review(state, step, upcoming, position)?;
            self.advance(RunPhase::Executing)?;

            match verdict {
                Verdict::Approve => self.run_step(state, step)?,
                Verdict::Patch(patch) => {
                    info!(position, patch_steps = patch.len(), "critic patched step");
                    for patched in &patch {
                        self.run_step(state, patched)?;
                    }
                }
                Verdict::Block { comment } => {
                    info!(position, %comment, "critic blocked step");
                    let result = StepResult::failed(format!("blocked by critic: {comment}"), 0);
                    self.record(state, step, result)?;
                }
                Verdict::Unavailable { reason } => {
                    let result = StepResult::failed(format!("critic unavailable: {reason}"), 0);
                    self.record(state, step, result)?;
                }
            }
        }
        state.next_steps.clear();
        Ok(())
    }

    fn review(
        &self,
        state: &AgentState,
        step: &Step,
        upcoming: &[Step],
        position: usize,
    ) -> Result<Verdict> {
        let Some(critic) = &self.critic else {
            return Ok(Verdict::Approve);
        };
        let sandbox_path = self.executor.context().guard.root().display().to_string();
        let ctx = CriticContext {
            max_turns: self.settings.max_turns,
            sandbox_path: &sandbox_path,
            expected_paths: &self.expected_paths,
            safety_constraints: &self.settings.safety_constraints,
        };
        critic.review(&self.gateway(), state, step, upcoming, position, &ctx)
    }

    fn run_step(&self, state: &mut AgentState, step: &Step) -> Result<()> {
        let result = self.executor.execute(step)?;
        self.record(state, step, result)
    }

    fn record(&self, state: &mut AgentState, step: &Step, result: StepResult) -> Result<()> {
        state.execution_history.push(HistoryEntry {
            turn: state.current_turn,
            step: step.clone(),
            result,
        });
        self.store.save(state)
    }

    fn gateway(&self) -> OracleGateway<'_> {
        OracleGateway::new(
            self.oracle,
            &self.budget,
            self.settings.retry,
            self.settings.oracle_timeout,
            &self.settings.oracle_dir,
        )
    }

    fn advance(&mut self, next: RunPhase) -> Result<()> {
        let from = self.phase;
        self.phase.advance(next)?;
        info!(from = from.as_str(), to = next.as_str(), "phase transition");
        Ok(())
    }

    fn verify(&self) -> Option<Verification> {
        let criteria = self.settings.criteria.as_ref()?;
        let verification = verify_success(self.executor.context().guard.root(), criteria);
        if verification.status == VerifyStatus::AllPass {
            info!("verification passed");
        } else {
            warn!(
                status = verification.status.as_str(),
                "replanner reported completion but verification did not pass"
            );
        }
        Some(verification)
    }

    /// Record `err` in the state, mark the run failed and hand the error back.
    fn fail(&mut self, state: &mut AgentState, err: anyhow::Error) -> anyhow::Error {
        let kind = FailureKind::classify(&err);
        warn!(kind = kind.as_str(), error = %format!("{err:#}"), "run failed");
        state.error = Some(format!("{}: {err:#}", kind.as_str()));
        if let Err(phase_err) = self.phase.advance(RunPhase::Failed) {
            warn!(error = %phase_err, "phase already terminal");
        }
        if let Err(save_err) = self.store.save(state) {
            warn!(error = %format!("{save_err:#}"), "could not persist failed state");
        }
        err
    }
}
