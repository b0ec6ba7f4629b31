//! Tracing setup.
//!
//! Two layers share one registry:
//!
//! - **stderr**: developer diagnostics, compact, filtered by `RUST_LOG`
//!   (default `warn`, `debug` with `--verbose`).
//! - **run log** (`<run_dir>/run.log`): one line per event with timestamp and
//!   level, no ANSI, `info` by default and `debug` with `--verbose`.
//!   Unaffected by `RUST_LOG`.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber. Call once per process.
///
/// # Example
/// ```bash
/// RUST_LOG=taskrunner=debug taskrunner run "summarize notes.txt"
/// ```
pub fn init(verbose: bool, run_log: Option<&Path>) -> Result<()> {
    let stderr_default = if verbose { "debug" } else { "warn" };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(stderr_default));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_filter(stderr_filter);

    let file_layer = match run_log {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("create run log {}", path.display()))?;
            let level = if verbose { "debug" } else { "info" };
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(EnvFilter::new(format!("taskrunner={level}"))),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!("initialize tracing: {err}"))
}
