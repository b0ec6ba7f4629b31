//! Stable exit codes for taskrunner CLI commands.

/// Run completed with a final answer, or every verification criterion passed.
pub const OK: i32 = 0;
/// Invalid task/config/arguments or an unclassified failure.
pub const INVALID: i32 = 1;
/// Turn or oracle-call budget exhausted.
pub const BUDGET_EXCEEDED: i32 = 2;
/// A tool path resolved outside the sandbox.
pub const PATH_ESCAPE: i32 = 3;
/// No valid plan, or the oracle failed on every retry.
pub const NO_PROGRESS: i32 = 4;
