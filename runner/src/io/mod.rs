//! Side-effecting operations: filesystem, processes, network, oracle calls.

pub mod config;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod run_dir;
pub mod run_state;
pub mod sandbox;
pub mod tools;
