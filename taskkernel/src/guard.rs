//! Attempt admission strategies for the runner.
//!
//! The runner takes its guard as a constructor argument, so whether runs are
//! deduplicated is decided where the runner is built, not by patching it.

use anyhow::Result;
use tracing::debug;

use crate::io::idempotency::{AttemptKey, AttemptLock, AttemptRecord, IdempotencyLedger};

/// Admits or refuses an attempt, then finalizes it.
pub trait AttemptGuard {
    /// Proof of admission. Dropping it must release whatever it holds.
    type Permit;

    /// Admit an attempt for `key`, or refuse with a kernel error.
    fn admit(&self, key: &AttemptKey) -> Result<Self::Permit>;

    /// Finalize an admitted attempt. `record` is `None` when the attempt ended
    /// before anything ran and must not block a later attempt.
    fn settle(&self, permit: Self::Permit, record: Option<&AttemptRecord>) -> Result<()>;

    /// Key recorded as `idempotency_key` in evidence, if this guard keys attempts.
    fn idempotency_key(&self, key: &AttemptKey) -> Option<String>;
}

/// Policy B over the filesystem ledger: at most one attempt per identity, ever.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    ledger: IdempotencyLedger,
}

impl IdempotencyGuard {
    pub fn new(ledger: IdempotencyLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }
}

impl AttemptGuard for IdempotencyGuard {
    type Permit = AttemptLock;

    fn admit(&self, key: &AttemptKey) -> Result<AttemptLock> {
        self.ledger.acquire(key)
    }

    fn settle(&self, permit: AttemptLock, record: Option<&AttemptRecord>) -> Result<()> {
        // The record must be on disk before the lock goes away.
        let written = match record {
            Some(record) => self.ledger.write_record(record),
            None => Ok(()),
        };
        let released = permit.release();
        written?;
        released
    }

    fn idempotency_key(&self, key: &AttemptKey) -> Option<String> {
        Some(key.identity.clone())
    }
}

/// No admission control. Every call runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unguarded;

impl AttemptGuard for Unguarded {
    type Permit = ();

    fn admit(&self, key: &AttemptKey) -> Result<()> {
        debug!(task_id = %key.task_id, "unguarded attempt");
        Ok(())
    }

    fn settle(&self, _permit: (), _record: Option<&AttemptRecord>) -> Result<()> {
        Ok(())
    }

    fn idempotency_key(&self, _key: &AttemptKey) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionOutcome;
    use crate::error::{KernelError, kernel_error};

    #[test]
    fn settle_without_record_allows_a_later_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let guard = IdempotencyGuard::new(IdempotencyLedger::new(
            temp.path().join("locks"),
            temp.path().join("records"),
        ));
        let key = AttemptKey::new("t1", "abc");
        let permit = guard.admit(&key).expect("admit");
        guard.settle(permit, None).expect("settle");
        let permit = guard.admit(&key).expect("admit again");
        guard.settle(permit, None).expect("settle");
    }

    #[test]
    fn settle_with_record_blocks_forever() {
        let temp = tempfile::tempdir().expect("tempdir");
        let guard = IdempotencyGuard::new(IdempotencyLedger::new(
            temp.path().join("locks"),
            temp.path().join("records"),
        ));
        let key = AttemptKey::new("t1", "abc");
        let permit = guard.admit(&key).expect("admit");
        let record = AttemptRecord {
            task_id: "t1".to_string(),
            exec_identity_hash: "abc".to_string(),
            status: ExecutionOutcome::Failed,
            exec_id: Some("e1".to_string()),
            manifest_sha256: None,
            reason: "exit_code:1".to_string(),
        };
        guard.settle(permit, Some(&record)).expect("settle");
        assert!(!guard.ledger().lock_path(&key).exists());

        let err = guard.admit(&key).expect_err("blocked");
        assert!(matches!(
            kernel_error(&err),
            Some(KernelError::DuplicateExecution { .. })
        ));
    }

    #[test]
    fn unguarded_never_refuses() {
        let key = AttemptKey::new("t1", "abc");
        Unguarded.admit(&key).expect("admit");
        Unguarded.admit(&key).expect("admit");
        assert_eq!(Unguarded.idempotency_key(&key), None);
    }
}
