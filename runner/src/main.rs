//! Autonomous task runner CLI.
//!
//! `taskrunner run <task...>` plans, executes and replans inside a fresh run
//! directory under the configured sandbox root. Exit codes are listed in
//! [`taskrunner::exit_codes`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use taskrunner::core::catalog::render_catalog;
use taskrunner::core::errors::FailureKind;
use taskrunner::exit_codes;
use taskrunner::io::config::{
    ConfigOverrides, DEFAULT_CONFIG_FILE, RunnerConfig, load_config, write_config,
};
use taskrunner::io::oracle::CommandOracle;
use taskrunner::io::prompt::PromptEngine;
use taskrunner::io::run_dir::create_run;
use taskrunner::io::run_state::JsonStateStore;
use taskrunner::io::sandbox::PathGuard;
use taskrunner::io::tools::{StepExecutor, ToolContext, ToolRegistry};
use taskrunner::logging;
use taskrunner::orchestrator::{Orchestrator, RunOutcome, RunSettings};
use taskrunner::verify::verify_file;

#[derive(Parser)]
#[command(
    name = "taskrunner",
    version,
    about = "Plan, execute and replan sandboxed tool steps for a task"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task to completion in a fresh sandbox.
    Run(RunArgs),
    /// Check verification criteria against a sandbox directory.
    Verify {
        /// Directory the criteria paths are relative to.
        #[arg(long)]
        sandbox: PathBuf,
        /// JSON file with an array of criteria.
        criteria: PathBuf,
    },
    /// Print the tool catalog and the configured limits.
    Tools {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Write the default config file.
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Task description.
    #[arg(required = true, trailing_var_arg = true)]
    task: Vec<String>,
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    sandbox_root: Option<PathBuf>,
    #[arg(long)]
    max_turns: Option<u32>,
    #[arg(long = "max-calls")]
    max_oracle_calls: Option<u32>,
    /// Number of plan candidates generated in parallel.
    #[arg(long)]
    candidates: Option<u32>,
    /// Review every step with the critic.
    #[arg(long)]
    critic: bool,
    /// JSON file with verification criteria (advisory).
    #[arg(long)]
    criteria: Option<PathBuf>,
    /// Debug logging on stderr and in run.log.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Run(args) => cmd_run(args),
        Command::Verify { sandbox, criteria } => Ok(cmd_verify(&sandbox, &criteria)),
        Command::Tools { config } => cmd_tools(&config),
        Command::InitConfig { config, force } => cmd_init_config(&config, force),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let task = args.task.join(" ");
    if task.trim().is_empty() {
        bail!("task must not be empty");
    }
    let overrides = ConfigOverrides {
        sandbox_root: args.sandbox_root,
        max_turns: args.max_turns,
        max_oracle_calls: args.max_oracle_calls,
        plan_candidates: args.candidates,
        critic: args.critic.then_some(true),
    };
    let cfg = overrides.apply(load_config(&args.config)?)?;
    let criteria = args.criteria.as_deref().map(load_criteria).transpose()?;

    let paths = create_run(&cfg.sandbox_root)?;
    logging::init(args.verbose, Some(&paths.log))?;
    info!(run_id = %paths.run_id, root = %paths.root.display(), "run created");

    let guard = PathGuard::new(&paths.workspace)?;
    let executor = StepExecutor::new(
        ToolRegistry::standard()?,
        ToolContext::new(guard, cfg.tool_limits()),
    );
    let oracle = CommandOracle::new(
        cfg.oracle.command.clone(),
        PromptEngine::new(cfg.prompt_budget_bytes),
        cfg.oracle.output_limit_bytes,
    )?;
    let store = JsonStateStore::new(&paths.state)?;
    let settings = RunSettings::from_config(&cfg, &paths.oracle, criteria);
    let mut orchestrator = Orchestrator::new(&oracle, executor, store, settings)?;

    match orchestrator.run(&task) {
        Ok(outcome) => {
            println!("{}", outcome.final_answer);
            eprintln!("{}", summary(&paths.run_id, &paths.state, &outcome));
            Ok(exit_codes::OK)
        }
        Err(err) => {
            let kind = FailureKind::classify(&err);
            eprintln!("run {} failed [{}]: {:#}", paths.run_id, kind.as_str(), err);
            eprintln!("state: {}", paths.state.display());
            Ok(kind.exit_code())
        }
    }
}

fn summary(run_id: &str, state_path: &Path, outcome: &RunOutcome) -> String {
    let mut lines = vec![
        format!(
            "run {run_id} completed in {} turn(s) using {} oracle call(s)",
            outcome.turns, outcome.oracle_calls
        ),
        format!(
            "plan: candidate {} ({} survived, {} unique)",
            outcome.plan_candidate, outcome.surviving_candidates, outcome.unique_candidates
        ),
        format!("state: {}", state_path.display()),
    ];
    if let Some(verification) = &outcome.verification {
        lines.push(format!("verification: {}", verification.status.as_str()));
    }
    lines.join("\n")
}

fn load_criteria(path: &Path) -> Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read criteria {}", path.display()))?;
    let criteria: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse criteria {}", path.display()))?;
    if !criteria.is_array() {
        bail!("criteria {} must be a JSON array", path.display());
    }
    Ok(criteria)
}

fn cmd_verify(sandbox: &Path, criteria: &Path) -> i32 {
    let verification = verify_file(sandbox, criteria);
    for outcome in &verification.outcomes {
        let mark = if outcome.passed { "pass" } else { "FAIL" };
        println!("[{mark}] #{} {}: {}", outcome.index, outcome.kind, outcome.detail);
    }
    println!("status: {}", verification.status.as_str());
    verification.status.exit_code()
}

fn cmd_tools(config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    print!("{}", render_catalog());
    print!("{}", render_limits(&cfg));
    Ok(exit_codes::OK)
}

fn render_limits(cfg: &RunnerConfig) -> String {
    let limits = cfg.tool_limits();
    format!(
        "limits:\n  file size: {} bytes\n  download size: {} bytes\n  file tool timeout: {}s\n  network tool timeout: {}s\n  text_replace max hits: {}\n  internal network blocked: {}\n",
        limits.file_bytes,
        limits.download_bytes,
        limits.file_timeout.as_secs(),
        limits.network_timeout.as_secs(),
        limits.replace_max_hits,
        limits.block_internal_ips,
    )
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &RunnerConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}
