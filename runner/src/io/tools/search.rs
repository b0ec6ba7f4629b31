//! Read-only text tools: regex line search, pattern extraction, JSON filtering.

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use super::files::read_text;
use super::{ToolContext, ToolError, ToolHandler, required};
use crate::core::catalog::ToolName;
use crate::core::text::truncate_marked;
use crate::core::types::Step;

/// Compiled regex size cap; keeps hostile patterns from eating memory.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

pub struct SearchText;
pub struct ExtractPattern;
pub struct FilterJson;

impl ToolHandler for SearchText {
    fn name(&self) -> ToolName {
        ToolName::SearchText
    }

    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError> {
        let pattern = compile(required(step, "pattern")?)?;
        let (contents, path) = read_text(ctx, required(step, "path")?)?;
        let hits: Vec<String> = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| pattern.is_match(line))
            .map(|(index, line)| format!("{}: {line}", index + 1))
            .collect();
        if hits.is_empty() {
            return Ok(format!("no matches in {}", ctx.guard.display(&path)));
        }
        Ok(truncate_marked(&hits.join("\n"), ctx.limits.file_bytes as usize))
    }
}

impl ToolHandler for ExtractPattern {
    fn name(&self) -> ToolName {
        ToolName::ExtractPattern
    }

    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError> {
        let pattern = compile(required(step, "pattern")?)?;
        let (contents, path) = read_text(ctx, required(step, "path")?)?;
        let group = usize::from(pattern.captures_len() > 1);
        let matches: Vec<&str> = pattern
            .captures_iter(&contents)
            .filter_map(|caps| caps.get(group))
            .map(|m| m.as_str())
            .collect();
        if matches.is_empty() {
            return Ok(format!("no matches in {}", ctx.guard.display(&path)));
        }
        Ok(truncate_marked(&matches.join("\n"), ctx.limits.file_bytes as usize))
    }
}

impl ToolHandler for FilterJson {
    fn name(&self) -> ToolName {
        ToolName::FilterJson
    }

    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError> {
        let raw_query = required(step, "query")?;
        let query = parse_query(raw_query)?;
        let (contents, path) = read_text(ctx, required(step, "path")?)?;
        let document: Value = serde_json::from_str(&contents).map_err(|err| {
            ToolError::Failed(format!("{} is not JSON: {err}", ctx.guard.display(&path)))
        })?;
        let selected = select(&document, &query).ok_or_else(|| {
            ToolError::Failed(format!(
                "query {raw_query} matched nothing in {}",
                ctx.guard.display(&path)
            ))
        })?;
        let rendered = match selected {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other)
                .map_err(|err| ToolError::Failed(format!("render selection: {err}")))?,
        };
        Ok(truncate_marked(&rendered, ctx.limits.file_bytes as usize))
    }
}

fn compile(pattern: &str) -> Result<Regex, ToolError> {
    if pattern.is_empty() {
        return Err(ToolError::InvalidParam {
            name: "pattern",
            reason: "must not be empty".to_string(),
        });
    }
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|err| ToolError::InvalidParam {
            name: "pattern",
            reason: err.to_string(),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse `.a.b[0]["odd key"]` style queries. `.` alone selects the whole document.
fn parse_query(query: &str) -> Result<Vec<Segment>, ToolError> {
    let invalid = |reason: &str| ToolError::InvalidParam {
        name: "query",
        reason: format!("{query:?}: {reason}"),
    };
    let rest = query
        .trim()
        .strip_prefix('.')
        .ok_or_else(|| invalid("must start with '.'"))?;

    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();
    let mut key = String::new();
    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if key.is_empty() {
                    return Err(invalid("empty key"));
                }
                segments.push(Segment::Key(std::mem::take(&mut key)));
            }
            '[' => {
                if !key.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                }
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err(invalid("unclosed '['"));
                }
                let inner = inner.trim();
                if let Some(quoted) = inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                    segments.push(Segment::Key(quoted.to_string()));
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| invalid("index must be a non-negative integer"))?;
                    segments.push(Segment::Index(index));
                }
                if chars.peek() == Some(&'.') {
                    chars.next();
                    if chars.peek().is_none() {
                        return Err(invalid("trailing '.'"));
                    }
                }
            }
            other => key.push(other),
        }
    }
    if !key.is_empty() {
        segments.push(Segment::Key(key));
    }
    Ok(segments)
}

fn select<'a>(document: &'a Value, query: &[Segment]) -> Option<&'a Value> {
    query.iter().try_fold(document, |current, segment| match segment {
        Segment::Key(key) => current.get(key.as_str()),
        Segment::Index(index) => current.get(*index),
    })
}
