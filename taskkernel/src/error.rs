//! Fail-closed denial errors.
//!
//! Operational failures (I/O, parse errors) travel as plain `anyhow` errors.
//! Deliberate refusals travel as [`KernelError`] inside `anyhow`, so callers
//! can tell "the kernel said no" from "the disk broke" with
//! `err.downcast_ref::<KernelError>()`. Every refusal renders a stable
//! [`KernelError::reason`] string; that string is what rejection bundles are
//! keyed by on disk.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::core::types::TaskState;

/// Fixed set of refusal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownRole,
    UnknownAction,
    Prohibited,
    NotAuthorized,
    InvalidState,
    LockHeld,
    DuplicateExecution,
    PathNotAllowlisted,
    CwdNotAllowlisted,
    UnsupportedKind,
    InvalidPayload,
    InvalidId,
    TaskMismatch,
    EvidenceCollision,
    BundleExists,
    ChainMismatch,
    EventExists,
    FsmViolation,
    DuplicateRefinement,
    Timeout,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnknownRole => "unknown_role",
            ErrorKind::UnknownAction => "unknown_action",
            ErrorKind::Prohibited => "prohibited",
            ErrorKind::NotAuthorized => "not_authorized",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::LockHeld => "lock_held",
            ErrorKind::DuplicateExecution => "duplicate_execution",
            ErrorKind::PathNotAllowlisted => "path_not_allowlisted",
            ErrorKind::CwdNotAllowlisted => "cwd_not_allowlisted",
            ErrorKind::UnsupportedKind => "unsupported_execution_kind",
            ErrorKind::InvalidPayload => "invalid_payload",
            ErrorKind::InvalidId => "invalid_id",
            ErrorKind::TaskMismatch => "task_mismatch",
            ErrorKind::EvidenceCollision => "evidence_collision",
            ErrorKind::BundleExists => "bundle_exists",
            ErrorKind::ChainMismatch => "chain_mismatch",
            ErrorKind::EventExists => "event_exists",
            ErrorKind::FsmViolation => "fsm_violation",
            ErrorKind::DuplicateRefinement => "duplicate_refinement",
            ErrorKind::Timeout => "timeout",
        }
    }
}

/// A refusal the kernel made on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Replay hit an illegal, unknown or post-terminal event.
    #[error("fsm violation {evidence_sha256}: {reason}")]
    FsmViolation {
        task_id: String,
        reason: String,
        evidence_sha256: String,
    },

    /// Policy said no. `reason` is the decision's reason string.
    #[error("policy denied: {reason}")]
    PolicyDenied { kind: ErrorKind, reason: String },

    #[error("invalid_state:{state}")]
    InvalidState { task_id: String, state: TaskState },

    /// Another caller holds the attempt lock. Busy, not permanent.
    #[error("Idempotent lock held for {task_id} ({identity})")]
    LockHeld { task_id: String, identity: String },

    /// An attempt for this identity already reached a terminal outcome.
    #[error("Duplicate execution prevented for {task_id} ({identity})")]
    DuplicateExecution {
        task_id: String,
        identity: String,
        prior_exec_id: Option<String>,
        prior_manifest_sha256: Option<String>,
    },

    #[error("arg_path_not_allowlisted:{path}")]
    PathNotAllowlisted { path: PathBuf },

    #[error("cwd_not_allowlisted:{path}")]
    CwdNotAllowlisted { path: PathBuf },

    #[error("unsupported_execution_kind:{kind}")]
    UnsupportedKind { kind: String },

    #[error("invalid_payload:{detail}")]
    InvalidPayload { detail: String },

    #[error("invalid_id:{field}:{value}")]
    InvalidId { field: &'static str, value: String },

    /// A resubmitted task disagrees with its recorded `TASK_CREATED`.
    #[error("task_mismatch:{task_id}")]
    TaskMismatch { task_id: String },

    /// Write-once bundle already holds different content.
    #[error("evidence collision at {}", path.display())]
    EvidenceCollision { path: PathBuf },

    /// Execution bundles are never re-published.
    #[error("evidence bundle already exists at {}", path.display())]
    BundleExists { path: PathBuf },

    #[error("chain mismatch in {task_id} at seq {seq}: {detail}")]
    ChainMismatch {
        task_id: String,
        seq: u64,
        detail: String,
    },

    #[error("event {seq} already exists for {task_id}")]
    EventExists { task_id: String, seq: u64 },

    #[error("refinement task {task_id} already exists")]
    DuplicateRefinement { task_id: String },
}

impl KernelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::FsmViolation { .. } => ErrorKind::FsmViolation,
            KernelError::PolicyDenied { kind, .. } => *kind,
            KernelError::InvalidState { .. } => ErrorKind::InvalidState,
            KernelError::LockHeld { .. } => ErrorKind::LockHeld,
            KernelError::DuplicateExecution { .. } => ErrorKind::DuplicateExecution,
            KernelError::PathNotAllowlisted { .. } => ErrorKind::PathNotAllowlisted,
            KernelError::CwdNotAllowlisted { .. } => ErrorKind::CwdNotAllowlisted,
            KernelError::UnsupportedKind { .. } => ErrorKind::UnsupportedKind,
            KernelError::InvalidPayload { .. } => ErrorKind::InvalidPayload,
            KernelError::InvalidId { .. } => ErrorKind::InvalidId,
            KernelError::TaskMismatch { .. } => ErrorKind::TaskMismatch,
            KernelError::EvidenceCollision { .. } => ErrorKind::EvidenceCollision,
            KernelError::BundleExists { .. } => ErrorKind::BundleExists,
            KernelError::ChainMismatch { .. } => ErrorKind::ChainMismatch,
            KernelError::EventExists { .. } => ErrorKind::EventExists,
            KernelError::DuplicateRefinement { .. } => ErrorKind::DuplicateRefinement,
        }
    }

    /// Stable audit reason, used as the rejection bundle key.
    pub fn reason(&self) -> String {
        match self {
            KernelError::FsmViolation {
                evidence_sha256, ..
            } => format!("fsm_violation:{evidence_sha256}"),
            KernelError::PolicyDenied { reason, .. } => reason.clone(),
            KernelError::LockHeld { .. } => "lock_held".to_string(),
            KernelError::DuplicateExecution { .. } => "duplicate_execution".to_string(),
            KernelError::ChainMismatch { task_id, seq, .. } => {
                format!("chain_mismatch:{task_id}:{seq}")
            }
            other => other.to_string(),
        }
    }

    /// Lock contention is the only refusal worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KernelError::LockHeld { .. })
    }
}

/// Find the kernel refusal inside an `anyhow` chain, if there is one.
pub fn kernel_error(err: &anyhow::Error) -> Option<&KernelError> {
    err.downcast_ref::<KernelError>()
}
