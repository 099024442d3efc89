//! Filesystem attempt ledger and mutual exclusion.
//!
//! Both primitives are create-exclusive files, so contention is resolved by
//! the filesystem even between separate processes:
//!
//! - `locks/<task_id>_<identity>.lock` exists while one caller owns the attempt.
//! - `records/<task_id>_<identity>.json` is written once, after the attempt's
//!   terminal outcome is known. Its presence blocks every later attempt.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::canonical::canonical_json;
use crate::core::types::ExecutionOutcome;
use crate::error::KernelError;
use crate::io::atomic::{create_exclusive, publish_exclusive};

/// `(task_id, execution identity)`: the unit of at-most-once execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptKey {
    pub task_id: String,
    /// `sha256(canonical_json(ExecutionSpec))`.
    pub identity: String,
}

impl AttemptKey {
    pub fn new(task_id: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            identity: identity.into(),
        }
    }

    fn stem(&self) -> String {
        format!("{}_{}", self.task_id, self.identity)
    }
}

/// Terminal ledger entry for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_id: String,
    pub exec_identity_hash: String,
    pub status: ExecutionOutcome,
    pub exec_id: Option<String>,
    pub manifest_sha256: Option<String>,
    pub reason: String,
}

impl AttemptRecord {
    pub fn key(&self) -> AttemptKey {
        AttemptKey::new(&self.task_id, &self.exec_identity_hash)
    }
}

/// Held attempt lock. Removing the lock file on drop makes release
/// unconditional, including on early returns and panics.
#[derive(Debug)]
pub struct AttemptLock {
    path: PathBuf,
    released: bool,
}

impl AttemptLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now and report failures instead of only logging them.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path)
            .with_context(|| format!("release lock {}", self.path.display()))
    }
}

impl Drop for AttemptLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(err = %err, lock = %self.path.display(), "failed to release attempt lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyLedger {
    locks_dir: PathBuf,
    records_dir: PathBuf,
}

impl IdempotencyLedger {
    pub fn new(locks_dir: impl Into<PathBuf>, records_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            records_dir: records_dir.into(),
        }
    }

    pub fn lock_path(&self, key: &AttemptKey) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", key.stem()))
    }

    pub fn record_path(&self, key: &AttemptKey) -> PathBuf {
        self.records_dir.join(format!("{}.json", key.stem()))
    }

    pub fn load_record(&self, key: &AttemptKey) -> Result<Option<AttemptRecord>> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let record =
            serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(record))
    }

    /// Take the lock, or `None` when another caller holds it.
    pub fn try_lock(&self, key: &AttemptKey) -> Result<Option<AttemptLock>> {
        let path = self.lock_path(key);
        let Some(mut file) = create_exclusive(&path)? else {
            return Ok(None);
        };
        let lock = AttemptLock {
            path,
            released: false,
        };
        writeln!(file, "pid={}", std::process::id())
            .with_context(|| format!("write {}", lock.path.display()))?;
        Ok(Some(lock))
    }

    /// Admit a new attempt under Policy B: no attempt after any prior attempt.
    ///
    /// Checks the ledger, takes the lock, then checks the ledger again so a
    /// caller that lost the race to a finished attempt sees the duplicate.
    pub fn acquire(&self, key: &AttemptKey) -> Result<AttemptLock> {
        if let Some(prior) = self.load_record(key)? {
            return Err(duplicate(key, &prior).into());
        }
        let Some(lock) = self.try_lock(key)? else {
            debug!(task_id = %key.task_id, "attempt lock held");
            return Err(KernelError::LockHeld {
                task_id: key.task_id.clone(),
                identity: key.identity.clone(),
            }
            .into());
        };
        if let Some(prior) = self.load_record(key)? {
            return Err(duplicate(key, &prior).into());
        }
        Ok(lock)
    }

    /// Write the terminal record. Fails if one already exists.
    pub fn write_record(&self, record: &AttemptRecord) -> Result<()> {
        let key = record.key();
        let bytes = canonical_json(record)?;
        if !publish_exclusive(&self.record_path(&key), bytes.as_bytes())? {
            let prior = self.load_record(&key)?.unwrap_or_else(|| record.clone());
            return Err(duplicate(&key, &prior).into());
        }
        info!(
            task_id = %record.task_id,
            status = %record.status,
            "recorded attempt"
        );
        Ok(())
    }
}

fn duplicate(key: &AttemptKey, prior: &AttemptRecord) -> KernelError {
    KernelError::DuplicateExecution {
        task_id: key.task_id.clone(),
        identity: key.identity.clone(),
        prior_exec_id: prior.exec_id.clone(),
        prior_manifest_sha256: prior.manifest_sha256.clone(),
    }
}
