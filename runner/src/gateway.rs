//! Budgeted, retried access to the oracle.
//!
//! Every attempt reserves one slot of the shared [`CallBudget`] before the
//! oracle is invoked. A refused reservation is returned immediately and is
//! never retried. Anything else (oracle failure, schema violation, a parse
//! closure rejecting the document) consumes one attempt of the
//! [`RetryPolicy`].

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::CallBudget;
use crate::core::errors::OracleExhaustedError;
use crate::core::retry::RetryPolicy;
use crate::core::schemas;
use crate::io::oracle::{Oracle, OracleRequest, OracleTemplate};

/// One logical oracle call, possibly spanning several attempts.
#[derive(Debug, Clone)]
pub struct OracleCall<'a> {
    pub template: OracleTemplate,
    /// Artifact directory name under `oracle/`, e.g. `plan-0`.
    pub label: String,
    pub variables: Value,
    pub schema: &'a Value,
    pub temperature: f32,
}

pub struct OracleGateway<'a> {
    oracle: &'a dyn Oracle,
    budget: &'a CallBudget,
    policy: RetryPolicy,
    timeout: Duration,
    artifacts_dir: PathBuf,
}

impl<'a> OracleGateway<'a> {
    pub fn new(
        oracle: &'a dyn Oracle,
        budget: &'a CallBudget,
        policy: RetryPolicy,
        timeout: Duration,
        artifacts_dir: &Path,
    ) -> Self {
        Self {
            oracle,
            budget,
            policy,
            timeout,
            artifacts_dir: artifacts_dir.to_path_buf(),
        }
    }

    /// Call the oracle until `parse` accepts a schema-valid document.
    ///
    /// Fails with [`BudgetExceededError`](crate::core::errors::BudgetExceededError)
    /// when the budget refuses an attempt, and with [`OracleExhaustedError`]
    /// once every attempt failed.
    #[instrument(skip_all, fields(label = %call.label, template = call.template.as_str()))]
    pub fn call<T>(&self, call: OracleCall<'_>, parse: impl Fn(&Value) -> Result<T>) -> Result<T> {
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            let call_number = self.budget.acquire()?;
            debug!(
                attempt,
                call_number,
                remaining = self.budget.remaining(),
                "issuing oracle call"
            );
            let request = OracleRequest {
                template: call.template,
                variables: call.variables.clone(),
                schema: call.schema.clone(),
                label: call.label.clone(),
                call_dir: self
                    .artifacts_dir
                    .join(&call.label)
                    .join(format!("attempt-{attempt}")),
                temperature: call.temperature,
                timeout: self.timeout,
            };
            let outcome = self.oracle.call(&request).and_then(|value| {
                schemas::validate(call.schema, &value, call.template.as_str())?;
                parse(&value)
            });
            match outcome {
                Ok(parsed) => {
                    if attempt > 1 {
                        info!(attempt, "oracle call recovered after retries");
                    }
                    return Ok(parsed);
                }
                Err(err) => {
                    last_error = format!("{err:#}");
                    match self.policy.delay_after(attempt) {
                        Some(delay) => {
                            warn!(
                                attempt,
                                max_attempts = self.policy.max_attempts,
                                backoff_ms = delay.as_millis() as u64,
                                error = %last_error,
                                "oracle call failed, retrying"
                            );
                            thread::sleep(delay);
                        }
                        None => {
                            warn!(attempt, error = %last_error, "oracle call failed, giving up");
                        }
                    }
                }
            }
        }
        Err(OracleExhaustedError {
            label: call.label,
            attempts: self.policy.max_attempts,
            last_error,
        }
        .into())
    }
}
