//! Path boundary checks run before any process is spawned.
//!
//! Allowlist semantics: an entry that resolves to an existing file allows
//! exactly that file; any other entry (directory or not-yet-existing path) is a
//! directory prefix and allows itself and its descendants. All comparisons use
//! real paths so symlinks cannot smuggle an argument outside the boundary.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::core::spec::ExecutionSpec;
use crate::error::KernelError;

/// Lexically normalize `path` (no filesystem access).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Canonicalize the longest existing ancestor and re-attach the remainder.
pub fn canonicalize_best_effort(path: &Path) -> PathBuf {
    if let Ok(real) = fs::canonicalize(path) {
        return real;
    }
    let mut existing = path.to_path_buf();
    while !existing.exists() {
        if !existing.pop() {
            return path.to_path_buf();
        }
    }
    match (fs::canonicalize(&existing), path.strip_prefix(&existing)) {
        (Ok(real), Ok(rest)) => real.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Absolute real path of `path`, resolved against `base` when relative.
pub fn real_abs(path: &Path, base: &Path) -> PathBuf {
    canonicalize_best_effort(&normalize_path(&base.join(path)))
}

/// Resolved allowlist entries.
#[derive(Debug, Clone)]
pub struct PathAllowlist {
    entries: Vec<(PathBuf, bool)>,
}

impl PathAllowlist {
    pub fn new(entries: &[String], base: &Path) -> Self {
        let mut entries: Vec<(PathBuf, bool)> = entries
            .iter()
            .map(|entry| {
                let real = real_abs(Path::new(entry), base);
                let is_file = real.is_file();
                (real, is_file)
            })
            .collect();
        entries.sort();
        Self { entries }
    }

    pub fn allows(&self, real: &Path) -> bool {
        self.entries.iter().any(|(entry, is_file)| {
            if *is_file {
                real == entry
            } else {
                real.starts_with(entry)
            }
        })
    }
}

/// True for tokens that look like filesystem paths.
fn is_path_shaped(token: &str) -> bool {
    Path::new(token).is_absolute() || token.contains(std::path::MAIN_SEPARATOR)
}

/// Path candidates inside one argv token: the token, or the value of `--flag=value`.
fn path_candidates(token: &str) -> Vec<&str> {
    let mut candidates = vec![token];
    if token.starts_with('-')
        && let Some((_, value)) = token.split_once('=')
        && !value.is_empty()
    {
        candidates.push(value);
    }
    candidates
}

/// Check `cwd` and every path-shaped argv token against the allowlist.
///
/// Absolute paths are always enforced. Relative path-shaped tokens are
/// enforced when they resolve to something that exists.
pub fn check_paths(spec: &ExecutionSpec) -> Result<(), KernelError> {
    let process_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let cwd_real = real_abs(Path::new(&spec.cwd), &process_cwd);
    let allow = PathAllowlist::new(&spec.paths_allowlist, &process_cwd);

    if !allow.allows(&cwd_real) {
        warn!(cwd = %cwd_real.display(), "cwd outside allowlist");
        return Err(KernelError::CwdNotAllowlisted { path: cwd_real });
    }

    for token in &spec.cmd_argv {
        for candidate in path_candidates(token) {
            let path = Path::new(candidate);
            let enforce = if path.is_absolute() {
                true
            } else if is_path_shaped(candidate) {
                real_abs(path, &cwd_real).exists()
            } else {
                false
            };
            if !enforce {
                continue;
            }
            let real = real_abs(path, &cwd_real);
            if !allow.allows(&real) {
                warn!(arg = %real.display(), "argument path outside allowlist");
                return Err(KernelError::PathNotAllowlisted { path: real });
            }
        }
    }
    debug!(cwd = %cwd_real.display(), "path preflight passed");
    Ok(())
}
