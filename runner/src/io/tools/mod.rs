//! Sandboxed tool handlers and the step executor that dispatches to them.
//!
//! Handlers return `Result<String, ToolError>`. The executor turns every
//! error into a failed [`StepResult`] except a sandbox escape, which it hands
//! back to the orchestrator as fatal.

pub mod files;
pub mod http;
pub mod search;

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::catalog::{LimitClass, ToolName, catalog, spec};
use crate::core::errors::PathEscapeError;
use crate::core::types::{Step, StepResult};
use crate::io::sandbox::{GuardError, PathGuard};

/// Size and time limits applied by the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolLimits {
    pub file_bytes: u64,
    pub download_bytes: u64,
    pub file_timeout: Duration,
    pub network_timeout: Duration,
    pub replace_max_hits: usize,
    /// Refuse loopback, private and link-local destinations.
    pub block_internal_ips: bool,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            file_bytes: 32 * 1024,
            download_bytes: 10 * 1024 * 1024,
            file_timeout: Duration::from_secs(30),
            network_timeout: Duration::from_secs(60),
            replace_max_hits: 1000,
            block_internal_ips: true,
        }
    }
}

impl ToolLimits {
    pub fn timeout_for(&self, class: LimitClass) -> Duration {
        match class {
            LimitClass::File => self.file_timeout,
            LimitClass::Network | LimitClass::Download => self.network_timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Escape(#[from] PathEscapeError),
    #[error("unknown tool '{0}'")]
    NotFound(String),
    #[error("missing required parameter '{0}'")]
    MissingParam(&'static str),
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: &'static str, reason: String },
    #[error("{what} is {actual} bytes, limit is {limit} bytes")]
    SizeLimit {
        what: &'static str,
        actual: u64,
        limit: u64,
    },
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("abandoned after the step timed out")]
    Cancelled,
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("{0}")]
    Failed(String),
    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },
}

impl ToolError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ToolError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<GuardError> for ToolError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Escape(escape) => ToolError::Escape(escape),
            GuardError::Invalid { input, reason } => ToolError::InvalidParam {
                name: "path",
                reason: format!("{input:?}: {reason}"),
            },
            GuardError::Io { path, source } => {
                ToolError::io(format!("resolve {}", path.display()), source)
            }
        }
    }
}

/// Everything a handler may touch.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub guard: PathGuard,
    pub limits: ToolLimits,
    /// Set once the executor stops waiting for this invocation.
    cancelled: Arc<AtomicBool>,
}

impl ToolContext {
    pub fn new(guard: PathGuard, limits: ToolLimits) -> Self {
        Self {
            guard,
            limits,
            cancelled: Arc::default(),
        }
    }

    /// Same guard and limits with a fresh cancellation flag.
    fn for_call(&self) -> Self {
        Self::new(self.guard.clone(), self.limits)
    }

    /// Handlers call this right before changing the workspace.
    pub fn ensure_active(&self) -> Result<(), ToolError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ToolError::Cancelled);
        }
        Ok(())
    }
}

/// Fetch a required parameter declared in the catalog.
pub(crate) fn required<'a>(step: &'a Step, name: &'static str) -> Result<&'a str, ToolError> {
    step.param(name).ok_or(ToolError::MissingParam(name))
}

pub trait ToolHandler: Send + Sync {
    fn name(&self) -> ToolName;
    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError>;
}

/// Tool name to handler map, checked against the catalog when built.
#[derive(Clone)]
pub struct ToolRegistry {
    handlers: BTreeMap<ToolName, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// Registry with a handler for every catalog tool.
    pub fn standard() -> Result<Self> {
        Self::from_handlers(vec![
            Arc::new(files::ReadFile),
            Arc::new(files::WriteFile),
            Arc::new(files::AppendFile),
            Arc::new(files::TextReplace),
            Arc::new(search::SearchText),
            Arc::new(search::ExtractPattern),
            Arc::new(search::FilterJson),
            Arc::new(http::HttpGet),
            Arc::new(http::DownloadFile),
        ])
    }

    pub fn from_handlers(handlers: Vec<Arc<dyn ToolHandler>>) -> Result<Self> {
        let mut map: BTreeMap<ToolName, Arc<dyn ToolHandler>> = BTreeMap::new();
        for handler in handlers {
            let name = handler.name();
            if map.insert(name, handler).is_some() {
                return Err(anyhow!("duplicate handler for tool '{name}'"));
            }
        }
        let missing: Vec<&str> = catalog()
            .iter()
            .filter(|spec| !map.contains_key(&spec.name))
            .map(|spec| spec.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(anyhow!("no handler for tool(s): {}", missing.join(", ")));
        }
        Ok(Self { handlers: map })
    }

    pub fn get(&self, name: ToolName) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(&name).cloned()
    }
}

/// Runs one step at a time against the registry.
#[derive(Clone)]
pub struct StepExecutor {
    registry: ToolRegistry,
    ctx: Arc<ToolContext>,
}

impl StepExecutor {
    pub fn new(registry: ToolRegistry, ctx: ToolContext) -> Self {
        Self {
            registry,
            ctx: Arc::new(ctx),
        }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Execute `step` and record its outcome.
    ///
    /// Returns `Err` only for a sandbox escape.
    #[instrument(skip_all, fields(tool = %step.tool))]
    pub fn execute(&self, step: &Step) -> Result<StepResult, PathEscapeError> {
        let started = Instant::now();
        let outcome = self.dispatch(step);
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(output) => {
                info!(duration_ms, bytes = output.len(), "step succeeded");
                Ok(StepResult::ok(output, elapsed.as_secs()))
            }
            Err(ToolError::Escape(escape)) => {
                warn!(err = %escape, "step attempted sandbox escape");
                Err(escape)
            }
            Err(err) => {
                warn!(duration_ms, err = %err, "step failed");
                Ok(StepResult::failed(err.to_string(), elapsed.as_secs()))
            }
        }
    }

    fn dispatch(&self, step: &Step) -> Result<String, ToolError> {
        let name = ToolName::parse(&step.tool).ok_or_else(|| ToolError::NotFound(step.tool.clone()))?;
        let tool_spec = spec(name);
        for param in tool_spec.params.iter().filter(|p| p.required) {
            required(step, param.name)?;
        }
        // Path parameters are checked here so no handler side effect (a
        // request, a created directory) happens for a step that escapes.
        for param in tool_spec.path_params() {
            if let Some(value) = step.param(param.name) {
                self.ctx.guard.safe_path(value)?;
            }
        }
        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::NotFound(step.tool.clone()))?;
        let timeout = self.ctx.limits.timeout_for(tool_spec.limit);
        run_with_timeout(handler, step.clone(), &self.ctx, timeout)
    }
}

/// Run a handler on a worker thread and stop waiting after `timeout`.
///
/// A timed-out worker is detached and its context cancelled, so it does not
/// write to the workspace after its step was recorded as failed. Network
/// handlers carry the same timeout on their client so they wind down on
/// their own.
fn run_with_timeout(
    handler: Arc<dyn ToolHandler>,
    step: Step,
    ctx: &ToolContext,
    timeout: Duration,
) -> Result<String, ToolError> {
    let ctx = Arc::new(ctx.for_call());
    let cancelled = Arc::clone(&ctx.cancelled);
    let (tx, rx) = mpsc::channel();
    let name = handler.name();
    thread::Builder::new()
        .name(format!("tool-{name}"))
        .spawn(move || {
            let result = handler.run(&step, &ctx);
            // The receiver is gone only if we already gave up waiting.
            let _ = tx.send(result);
        })
        .map_err(|err| ToolError::io("spawn tool worker", err))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            cancelled.store(true, Ordering::SeqCst);
            debug!(tool = %name, timeout_secs = timeout.as_secs(), "tool worker abandoned");
            Err(ToolError::Timeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(ToolError::Failed(format!("tool '{name}' worker panicked")))
        }
    }
}
