//! Atomic file primitives.
//!
//! Two publication modes exist. [`write_atomic`] replaces a file (temp file +
//! rename) and is only used for pointers such as `HEAD`. [`publish_exclusive`]
//! never replaces: it links a fully written temp file into place and reports
//! when the target already existed. History, ledger records and evidence use
//! the exclusive mode.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique sibling path used for staging writes next to `path`.
pub fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
}

fn ensure_parent(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))
}

fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", path.display()))
}

/// Replace `path` with `contents` via temp file + rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let tmp = staging_path(path);
    write_synced(&tmp, contents)?;
    fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))
}

/// Publish `contents` at `path` only if nothing is there yet.
///
/// Returns `false` (and leaves the existing file untouched) when `path`
/// already exists. Readers never observe a partially written file.
pub fn publish_exclusive(path: &Path, contents: &[u8]) -> Result<bool> {
    ensure_parent(path)?;
    let tmp = staging_path(path);
    write_synced(&tmp, contents)?;
    let linked = fs::hard_link(&tmp, path);
    let cleanup = fs::remove_file(&tmp);
    match linked {
        Ok(()) => {
            cleanup.with_context(|| format!("remove staging file {}", tmp.display()))?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("publish {}", path.display())),
    }
}

/// Create an empty marker file with `O_CREAT | O_EXCL` semantics.
///
/// Returns `Ok(None)` when the file already exists.
pub fn create_exclusive(path: &Path) -> Result<Option<File>> {
    ensure_parent(path)?;
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err).with_context(|| format!("create {}", path.display())),
    }
}

/// Move a fully staged directory into place. Returns `false` when `dest`
/// already exists, in which case the staged directory is removed.
pub fn publish_dir(staged: &Path, dest: &Path) -> Result<bool> {
    ensure_parent(dest)?;
    if dest.exists() {
        remove_staged_dir(staged)?;
        return Ok(false);
    }
    match fs::rename(staged, dest) {
        Ok(()) => Ok(true),
        Err(err) if dest.exists() => {
            remove_staged_dir(staged)?;
            tracing::debug!(err = %err, dest = %dest.display(), "lost directory publish race");
            Ok(false)
        }
        Err(err) => Err(err).with_context(|| format!("publish {}", dest.display())),
    }
}

fn remove_staged_dir(staged: &Path) -> Result<()> {
    fs::remove_dir_all(staged).with_context(|| format!("remove staging dir {}", staged.display()))
}
