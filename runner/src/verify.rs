//! Criteria-based completion check.
//!
//! Advisory only: the replanner's `completed` flag decides whether a run
//! succeeded. The verifier is reported next to it and can run standalone
//! (`taskrunner verify`).

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::io::sandbox::{GuardError, PathGuard};

/// Longest accepted `file_contains` needle.
pub const MAX_SUBSTR_BYTES: usize = 128;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum VerificationCriterion {
    FileExists { path: String },
    FileContains { path: String, substr: String },
    /// `key` is a dot-separated path; numeric segments index arrays.
    JsonKeyEquals { path: String, key: String, value: Value },
}

const KNOWN_TYPES: [&str; 3] = ["file_exists", "file_contains", "json_key_equals"];

impl VerificationCriterion {
    pub fn path(&self) -> &str {
        match self {
            VerificationCriterion::FileExists { path }
            | VerificationCriterion::FileContains { path, .. }
            | VerificationCriterion::JsonKeyEquals { path, .. } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            VerificationCriterion::FileExists { .. } => "file_exists",
            VerificationCriterion::FileContains { .. } => "file_contains",
            VerificationCriterion::JsonKeyEquals { .. } => "json_key_equals",
        }
    }
}

/// Overall verdict, by precedence Malformed > UnknownType > FatalIo > SomeFailed > AllPass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    AllPass,
    SomeFailed,
    UnknownType,
    Malformed,
    FatalIo,
}

impl VerifyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyStatus::AllPass => "all_pass",
            VerifyStatus::SomeFailed => "some_failed",
            VerifyStatus::UnknownType => "unknown_type",
            VerifyStatus::Malformed => "malformed",
            VerifyStatus::FatalIo => "fatal_io",
        }
    }

    /// Exit code of `taskrunner verify`.
    pub fn exit_code(&self) -> i32 {
        match self {
            VerifyStatus::AllPass => 0,
            VerifyStatus::SomeFailed => 1,
            VerifyStatus::UnknownType => 2,
            VerifyStatus::Malformed => 3,
            VerifyStatus::FatalIo => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionOutcome {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub status: VerifyStatus,
    pub outcomes: Vec<CriterionOutcome>,
}

impl Verification {
    fn only(status: VerifyStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            outcomes: vec![CriterionOutcome {
                index: 0,
                kind: "input".to_string(),
                passed: false,
                detail: detail.into(),
            }],
        }
    }
}

#[derive(Default)]
struct Flags {
    malformed: bool,
    unknown_type: bool,
    fatal_io: bool,
    failed: bool,
}

impl Flags {
    fn status(&self) -> VerifyStatus {
        if self.malformed {
            VerifyStatus::Malformed
        } else if self.unknown_type {
            VerifyStatus::UnknownType
        } else if self.fatal_io {
            VerifyStatus::FatalIo
        } else if self.failed {
            VerifyStatus::SomeFailed
        } else {
            VerifyStatus::AllPass
        }
    }
}

/// Read criteria from `criteria_path` and check them against `sandbox`.
pub fn verify_file(sandbox: &Path, criteria_path: &Path) -> Verification {
    let contents = match fs::read_to_string(criteria_path) {
        Ok(contents) => contents,
        Err(err) => {
            return Verification::only(
                VerifyStatus::FatalIo,
                format!("read {}: {err}", criteria_path.display()),
            );
        }
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(criteria) => verify_success(sandbox, &criteria),
        Err(err) => Verification::only(
            VerifyStatus::Malformed,
            format!("parse {}: {err}", criteria_path.display()),
        ),
    }
}

/// Check `criteria` (expected: a non-empty JSON array) against `sandbox`.
#[instrument(skip_all, fields(sandbox = %sandbox.display()))]
pub fn verify_success(sandbox: &Path, criteria: &Value) -> Verification {
    let Some(items) = criteria.as_array() else {
        return Verification::only(VerifyStatus::Malformed, "criteria must be a JSON array");
    };
    if items.is_empty() {
        return Verification::only(VerifyStatus::Malformed, "criteria array is empty");
    }
    if !sandbox.is_dir() {
        return Verification::only(
            VerifyStatus::FatalIo,
            format!("sandbox {} is not a directory", sandbox.display()),
        );
    }
    let guard = match PathGuard::new(sandbox) {
        Ok(guard) => guard,
        Err(err) => return Verification::only(VerifyStatus::FatalIo, format!("{err:#}")),
    };

    let mut flags = Flags::default();
    let mut outcomes = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let outcome = match parse_criterion(item) {
            Parsed::Criterion(criterion) => check(&guard, &criterion, &mut flags),
            Parsed::Unknown(kind) => {
                flags.unknown_type = true;
                (kind, false, "unsupported criterion type".to_string())
            }
            Parsed::Malformed(reason) => {
                flags.malformed = true;
                ("malformed".to_string(), false, reason)
            }
        };
        let (kind, passed, detail) = outcome;
        debug!(index, %kind, passed, %detail, "criterion result");
        outcomes.push(CriterionOutcome {
            index,
            kind,
            passed,
            detail,
        });
    }
    let status = flags.status();
    if status != VerifyStatus::AllPass {
        warn!(status = status.as_str(), "verification did not pass");
    }
    Verification { status, outcomes }
}

/// Paths named by well-formed criteria, in order, without duplicates.
pub fn criteria_paths(criteria: &Value) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for item in criteria.as_array().into_iter().flatten() {
        if let Parsed::Criterion(criterion) = parse_criterion(item)
            && !paths.iter().any(|p| p == criterion.path())
        {
            paths.push(criterion.path().to_string());
        }
    }
    paths
}

enum Parsed {
    Criterion(VerificationCriterion),
    Unknown(String),
    Malformed(String),
}

fn parse_criterion(item: &Value) -> Parsed {
    let Some(kind) = item.get("type").and_then(Value::as_str) else {
        return Parsed::Malformed("criterion must be an object with a string type".to_string());
    };
    if !KNOWN_TYPES.contains(&kind) {
        return Parsed::Unknown(kind.to_string());
    }
    let criterion: VerificationCriterion = match serde_json::from_value(item.clone()) {
        Ok(criterion) => criterion,
        Err(err) => return Parsed::Malformed(format!("{kind}: {err}")),
    };
    if criterion.path().is_empty() {
        return Parsed::Malformed(format!("{kind}: path must not be empty"));
    }
    if let VerificationCriterion::FileContains { substr, .. } = &criterion {
        if substr.is_empty() {
            return Parsed::Malformed("file_contains: substr must not be empty".to_string());
        }
        if substr.len() > MAX_SUBSTR_BYTES {
            return Parsed::Malformed(format!(
                "file_contains: substr is {} bytes (max {MAX_SUBSTR_BYTES})",
                substr.len()
            ));
        }
    }
    if let VerificationCriterion::JsonKeyEquals { key, .. } = &criterion
        && key.is_empty()
    {
        return Parsed::Malformed("json_key_equals: key must not be empty".to_string());
    }
    Parsed::Criterion(criterion)
}

fn check(
    guard: &PathGuard,
    criterion: &VerificationCriterion,
    flags: &mut Flags,
) -> (String, bool, String) {
    let kind = criterion.kind().to_string();
    let result = evaluate(guard, criterion);
    let (passed, detail) = match result {
        Ok(Ok(())) => (true, "ok".to_string()),
        Ok(Err(reason)) => {
            flags.failed = true;
            (false, reason)
        }
        Err(err) => {
            flags.fatal_io = true;
            (false, err)
        }
    };
    (kind, passed, detail)
}

/// `Ok(Err(reason))` is a failed criterion; `Err` is a fatal I/O problem.
fn evaluate(
    guard: &PathGuard,
    criterion: &VerificationCriterion,
) -> Result<Result<(), String>, String> {
    let path = match guard.safe_path(criterion.path()) {
        Ok(path) => path,
        Err(GuardError::Io { path, source }) => {
            return Err(format!("resolve {}: {source}", path.display()));
        }
        Err(err) => return Ok(Err(err.to_string())),
    };
    let shown = guard.display(&path);
    match criterion {
        VerificationCriterion::FileExists { .. } => match path.try_exists() {
            Ok(true) => Ok(Ok(())),
            Ok(false) => Ok(Err(format!("{shown} does not exist"))),
            Err(err) => Err(format!("stat {shown}: {err}")),
        },
        VerificationCriterion::FileContains { substr, .. } => {
            let Some(contents) = read_optional(&path, &shown)? else {
                return Ok(Err(format!("{shown} does not exist")));
            };
            let needle = substr.as_bytes();
            if contents.windows(needle.len()).any(|window| window == needle) {
                Ok(Ok(()))
            } else {
                Ok(Err(format!("{shown} does not contain {substr:?}")))
            }
        }
        VerificationCriterion::JsonKeyEquals { key, value, .. } => {
            let Some(contents) = read_optional(&path, &shown)? else {
                return Ok(Err(format!("{shown} does not exist")));
            };
            let document: Value = match serde_json::from_slice(&contents) {
                Ok(document) => document,
                Err(err) => return Ok(Err(format!("{shown} is not JSON: {err}"))),
            };
            match lookup(&document, key) {
                Some(actual) if actual == value => Ok(Ok(())),
                Some(actual) => Ok(Err(format!("{key} is {actual}, expected {value}"))),
                None => Ok(Err(format!("{key} not found in {shown}"))),
            }
        }
    }
}

fn read_optional(path: &Path, shown: &str) -> Result<Option<Vec<u8>>, String> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) if err.kind() == io::ErrorKind::IsADirectory => Ok(None),
        Err(err) => Err(format!("read {shown}: {err}")),
    }
}

fn lookup<'a>(document: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(document, |current, segment| match current {
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => current.get(segment),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("greeting.txt"), "Hello, World!\n").expect("seed");
        fs::write(
            temp.path().join("package.json"),
            r#"{"name": "demo", "version": "1.2.0", "files": ["a", "b"]}"#,
        )
        .expect("seed");
        temp
    }

    #[test]
    fn all_pass_needs_every_criterion() {
        let temp = sandbox();
        let criteria = json!([
            {"type": "file_exists", "path": "greeting.txt"},
            {"type": "file_contains", "path": "greeting.txt", "substr": "World"},
            {"type": "json_key_equals", "path": "package.json", "key": "version", "value": "1.2.0"},
            {"type": "json_key_equals", "path": "package.json", "key": "files.1", "value": "b"}
        ]);
        let verification = verify_success(temp.path(), &criteria);
        assert_eq!(verification.status, VerifyStatus::AllPass);
        assert!(verification.outcomes.iter().all(|o| o.passed));
    }

    #[test]
    fn one_failure_is_some_failed() {
        let temp = sandbox();
        let criteria = json!([
            {"type": "file_exists", "path": "greeting.txt"},
            {"type": "file_contains", "path": "greeting.txt", "substr": "Goodbye"}
        ]);
        let verification = verify_success(temp.path(), &criteria);
        assert_eq!(verification.status, VerifyStatus::SomeFailed);
        assert!(verification.outcomes[0].passed);
        assert!(!verification.outcomes[1].passed);
    }

    #[test]
    fn non_array_and_empty_are_malformed() {
        let temp = sandbox();
        assert_eq!(
            verify_success(temp.path(), &json!({"type": "file_exists"})).status,
            VerifyStatus::Malformed
        );
        assert_eq!(
            verify_success(temp.path(), &json!([])).status,
            VerifyStatus::Malformed
        );
    }

    #[test]
    fn unknown_type_beats_failures_but_not_malformed() {
        let temp = sandbox();
        let unknown = json!([
            {"type": "file_exists", "path": "missing.txt"},
            {"type": "http_ok", "url": "https://example.com"}
        ]);
        assert_eq!(
            verify_success(temp.path(), &unknown).status,
            VerifyStatus::UnknownType
        );

        let both = json!([
            {"type": "http_ok"},
            {"type": "file_contains", "path": "greeting.txt", "substr": "x".repeat(129)}
        ]);
        assert_eq!(verify_success(temp.path(), &both).status, VerifyStatus::Malformed);
    }

    #[test]
    fn substr_limit_is_inclusive() {
        let temp = sandbox();
        let exactly = json!([
            {"type": "file_contains", "path": "greeting.txt", "substr": "y".repeat(MAX_SUBSTR_BYTES)}
        ]);
        assert_eq!(verify_success(temp.path(), &exactly).status, VerifyStatus::SomeFailed);
    }

    #[test]
    fn escaping_path_fails_that_criterion() {
        let temp = sandbox();
        let criteria = json!([{"type": "file_exists", "path": "../../etc/passwd"}]);
        let verification = verify_success(temp.path(), &criteria);
        assert_eq!(verification.status, VerifyStatus::SomeFailed);
        assert!(verification.outcomes[0].detail.contains("escapes sandbox"));
    }

    #[test]
    fn missing_sandbox_is_fatal_io() {
        let temp = tempfile::tempdir().expect("tempdir");
        let criteria = json!([{"type": "file_exists", "path": "a"}]);
        let verification = verify_success(&temp.path().join("nope"), &criteria);
        assert_eq!(verification.status, VerifyStatus::FatalIo);
    }

    #[test]
    fn criteria_file_errors_map_to_statuses() {
        let temp = sandbox();
        let bad = temp.path().join("bad.json");
        fs::write(&bad, "not json").expect("seed");
        assert_eq!(verify_file(temp.path(), &bad).status, VerifyStatus::Malformed);
        assert_eq!(
            verify_file(temp.path(), &temp.path().join("absent.json")).status,
            VerifyStatus::FatalIo
        );
    }

    #[test]
    fn criteria_paths_dedups_in_order() {
        let criteria = json!([
            {"type": "file_exists", "path": "a.txt"},
            {"type": "file_contains", "path": "a.txt", "substr": "x"},
            {"type": "json_key_equals", "path": "b.json", "key": "k", "value": 1},
            {"type": "nope", "path": "c.txt"}
        ]);
        assert_eq!(criteria_paths(&criteria), vec!["a.txt", "b.json"]);
    }
}
