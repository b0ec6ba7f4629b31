//! Autonomous task runner.
//!
//! Given a natural-language task, the runner asks an external oracle for
//! candidate plans of sandboxed tool invocations, picks one, executes it step
//! by step (optionally gated by a critic) and replans from the execution
//! history until the task is complete or a hard budget runs out.
//!
//! - **[`core`]**: Pure, deterministic logic (catalog, plan dedup, budgets,
//!   retry schedule, phase machine, critic signals). No I/O.
//! - **[`io`]**: Side effects (sandboxed tools, oracle processes, state and
//!   config files).
//!
//! Orchestration modules ([`orchestrator`], [`planner`], [`critic`],
//! [`replan`], [`gateway`]) combine the two; [`verify`] checks completion
//! criteria independently.

pub mod core;
pub mod critic;
pub mod exit_codes;
pub mod gateway;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod planner;
pub mod replan;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
