//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod catalog;
pub mod critic_signals;
pub mod errors;
pub mod phase;
pub mod plan;
pub mod retry;
pub mod schemas;
pub mod text;
pub mod types;
