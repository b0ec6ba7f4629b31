//! Sandbox path confinement.
//!
//! Every path a tool touches goes through [`PathGuard::safe_path`]. Existing
//! prefixes are canonicalized (so symlinks are followed to their real
//! location) and the non-existent tail is normalized lexically. Anything that
//! lands outside the canonical root is a [`PathEscapeError`].

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::warn;

use crate::core::errors::PathEscapeError;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Escape(#[from] PathEscapeError),
    #[error("invalid path {input:?}: {reason}")]
    Invalid { input: String, reason: &'static str },
    #[error("resolve {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Confines paths to one canonical sandbox directory.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Create the sandbox directory if needed and pin its canonical location.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("create sandbox {}", root.display()))?;
        let root = fs::canonicalize(root)
            .with_context(|| format!("canonicalize sandbox {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `input` to an absolute path inside the sandbox.
    pub fn safe_path(&self, input: &str) -> Result<PathBuf, GuardError> {
        if input.trim().is_empty() {
            return Err(invalid(input, "empty path"));
        }
        if input.contains('\0') {
            return Err(invalid(input, "contains NUL byte"));
        }

        let candidate = Path::new(input);
        let mut resolved = if candidate.is_absolute() {
            PathBuf::from("/")
        } else {
            self.root.clone()
        };

        for component in candidate.components() {
            match component {
                Component::Prefix(prefix) => resolved = PathBuf::from(prefix.as_os_str()),
                Component::RootDir => resolved.push(component.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(name) => {
                    resolved.push(name);
                    resolved = resolve_existing(resolved, input)?;
                }
            }
        }

        if !resolved.starts_with(&self.root) {
            return Err(PathEscapeError {
                input: input.to_string(),
                resolved,
                root: self.root.clone(),
            }
            .into());
        }
        Ok(resolved)
    }

    /// Open `input` and confirm the opened file is the one a fresh resolution points at.
    ///
    /// Closes the window where the path is swapped for a symlink between
    /// resolution and open.
    pub fn open_verified(
        &self,
        input: &str,
        options: &OpenOptions,
    ) -> Result<(File, PathBuf), GuardError> {
        let path = self.safe_path(input)?;
        let file = options.open(&path).map_err(|source| GuardError::Io {
            path: path.clone(),
            source,
        })?;
        let again = self.safe_path(input)?;
        if again != path || !same_file(&file, &again)? {
            warn!(input, path = %path.display(), "sandbox path changed while opening");
            return Err(PathEscapeError {
                input: input.to_string(),
                resolved: again,
                root: self.root.clone(),
            }
            .into());
        }
        Ok((file, path))
    }

    /// `path` relative to the sandbox root, for messages shown to the oracle.
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn invalid(input: &str, reason: &'static str) -> GuardError {
    GuardError::Invalid {
        input: input.to_string(),
        reason,
    }
}

/// Canonicalize `path` if it exists; leave it untouched if it does not.
fn resolve_existing(path: PathBuf, input: &str) -> Result<PathBuf, GuardError> {
    match fs::symlink_metadata(&path) {
        Ok(meta) => match fs::canonicalize(&path) {
            Ok(real) => Ok(real),
            Err(_) if meta.file_type().is_symlink() => Err(invalid(input, "dangling symlink")),
            Err(source) => Err(GuardError::Io { path, source }),
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(path),
        Err(source) => Err(GuardError::Io { path, source }),
    }
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> Result<bool, GuardError> {
    use std::os::unix::fs::MetadataExt;

    let opened = file.metadata().map_err(|source| GuardError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let current = fs::metadata(path).map_err(|source| GuardError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(opened.dev() == current.dev() && opened.ino() == current.ino())
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> Result<bool, GuardError> {
    Ok(path.exists())
}
