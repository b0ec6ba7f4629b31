//! Local file tools: read, write, append, literal replace.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ToolContext, ToolError, ToolHandler, required};
use crate::core::catalog::ToolName;
use crate::core::text::truncate_marked;
use crate::core::types::Step;

pub struct ReadFile;
pub struct WriteFile;
pub struct AppendFile;
pub struct TextReplace;

impl ToolHandler for ReadFile {
    fn name(&self) -> ToolName {
        ToolName::ReadFile
    }

    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError> {
        let (contents, _) = read_text(ctx, required(step, "path")?)?;
        Ok(truncate_marked(&contents, ctx.limits.file_bytes as usize))
    }
}

impl ToolHandler for WriteFile {
    fn name(&self) -> ToolName {
        ToolName::WriteFile
    }

    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError> {
        let input = required(step, "path")?;
        let content = required(step, "content")?;
        check_size("content", content.len() as u64, ctx.limits.file_bytes)?;

        prepare_target(ctx, input)?;
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        ctx.ensure_active()?;
        let (mut file, path) = ctx.guard.open_verified(input, &options).map_err(ToolError::from)?;
        file.set_len(0)
            .map_err(|err| ToolError::io(format!("truncate {}", path.display()), err))?;
        file.write_all(content.as_bytes())
            .map_err(|err| ToolError::io(format!("write {}", path.display()), err))?;
        Ok(format!(
            "wrote {} bytes to {}",
            content.len(),
            ctx.guard.display(&path)
        ))
    }
}

impl ToolHandler for AppendFile {
    fn name(&self) -> ToolName {
        ToolName::AppendFile
    }

    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError> {
        let input = required(step, "path")?;
        let content = required(step, "content")?;
        check_size("content", content.len() as u64, ctx.limits.file_bytes)?;

        let path = prepare_target(ctx, input)?;
        let existing = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(ToolError::io(format!("stat {}", path.display()), err)),
        };
        check_size(
            "resulting file",
            existing + content.len() as u64,
            ctx.limits.file_bytes,
        )?;

        let mut options = OpenOptions::new();
        options.append(true).create(true);
        ctx.ensure_active()?;
        let (mut file, path) = ctx.guard.open_verified(input, &options).map_err(ToolError::from)?;
        file.write_all(content.as_bytes())
            .map_err(|err| ToolError::io(format!("append {}", path.display()), err))?;
        Ok(format!(
            "appended {} bytes to {} ({} bytes total)",
            content.len(),
            ctx.guard.display(&path),
            existing + content.len() as u64
        ))
    }
}

impl ToolHandler for TextReplace {
    fn name(&self) -> ToolName {
        ToolName::TextReplace
    }

    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError> {
        let input = required(step, "path")?;
        let search = required(step, "search")?;
        let replace = required(step, "replace")?;
        if search.is_empty() {
            return Err(ToolError::InvalidParam {
                name: "search",
                reason: "must not be empty".to_string(),
            });
        }

        let (original, path) = read_text(ctx, input)?;
        let hits = original.matches(search).count();
        if hits == 0 {
            return Err(ToolError::Failed(format!(
                "'{search}' not found in {}",
                ctx.guard.display(&path)
            )));
        }
        if hits > ctx.limits.replace_max_hits {
            return Err(ToolError::Failed(format!(
                "{hits} occurrences exceed the replace limit of {}",
                ctx.limits.replace_max_hits
            )));
        }
        let updated = original.replace(search, replace);
        check_size("result", updated.len() as u64, ctx.limits.file_bytes)?;

        replace_atomically(ctx, &path, updated.as_bytes())?;
        debug!(hits, path = %path.display(), "text replaced");
        Ok(format!(
            "replaced {hits} occurrence(s) in {}",
            ctx.guard.display(&path)
        ))
    }
}

pub(crate) fn check_size(what: &'static str, actual: u64, limit: u64) -> Result<(), ToolError> {
    if actual > limit {
        return Err(ToolError::SizeLimit {
            what,
            actual,
            limit,
        });
    }
    Ok(())
}

/// Read a sandbox file as UTF-8 text, refusing files over the size limit.
pub(crate) fn read_text(ctx: &ToolContext, input: &str) -> Result<(String, PathBuf), ToolError> {
    let mut options = OpenOptions::new();
    options.read(true);
    let (file, path) = ctx.guard.open_verified(input, &options).map_err(ToolError::from)?;
    let meta = file
        .metadata()
        .map_err(|err| ToolError::io(format!("stat {}", path.display()), err))?;
    if !meta.is_file() {
        return Err(ToolError::Failed(format!(
            "{} is not a regular file",
            ctx.guard.display(&path)
        )));
    }
    let len = meta.len();
    check_size("file", len, ctx.limits.file_bytes)?;

    let mut bytes = Vec::with_capacity(len as usize);
    file.take(ctx.limits.file_bytes + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| ToolError::io(format!("read {}", path.display()), err))?;
    check_size("file", bytes.len() as u64, ctx.limits.file_bytes)?;
    let text = String::from_utf8(bytes).map_err(|_| {
        ToolError::Failed(format!("{} is not UTF-8 text", ctx.guard.display(&path)))
    })?;
    Ok((text, path))
}

/// Resolve a write target and create its parent directories.
pub(crate) fn prepare_target(ctx: &ToolContext, input: &str) -> Result<PathBuf, ToolError> {
    let path = ctx.guard.safe_path(input)?;
    if path == ctx.guard.root() || path.is_dir() {
        return Err(ToolError::InvalidParam {
            name: "path",
            reason: format!("{input:?} is a directory"),
        });
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| ToolError::io(format!("create dir {}", parent.display()), err))?;
    }
    Ok(path)
}

/// Write `contents` to a temp file next to `path`, then rename it over `path`.
///
/// The temp file is removed on every error path when it is dropped.
fn replace_atomically(ctx: &ToolContext, path: &Path, contents: &[u8]) -> Result<(), ToolError> {
    let parent = path
        .parent()
        .ok_or_else(|| ToolError::Failed(format!("{} has no parent", path.display())))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".replace-")
        .tempfile_in(parent)
        .map_err(|err| ToolError::io(format!("create temp file in {}", parent.display()), err))?;
    temp.write_all(contents)
        .map_err(|err| ToolError::io("write temp file", err))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| ToolError::io("sync temp file", err))?;
    ctx.ensure_active()?;
    temp.persist(path)
        .map_err(|err| ToolError::io(format!("rename over {}", path.display()), err.error))?;
    Ok(())
}
