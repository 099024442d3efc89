//! One run-through of a dispatched task.
//!
//! ```text
//! rebuild state -> build spec -> guard.admit -> require DISPATCHED
//!   -> path preflight -> RUN_STARTED -> execute -> evidence bundle
//!   -> RUN_SUCCEEDED | RUN_FAILED -> guard.settle
//! ```
//!
//! A task that was never dispatched is refused with `invalid_state` before its
//! payload is even read. States at or past dispatch go on to the guard, which
//! reports a running attempt as busy and a finished one as a duplicate; the
//! DISPATCHED requirement is checked again under the lock.
//!
//! Every refusal leaves a rejection bundle. Refusals before `RUN_STARTED`
//! leave no ledger record, so the task can still be run once the cause is
//! fixed. Anything that fails after `RUN_STARTED` is settled with a forced
//! REJECTED record before the lock is released.

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::canonical::sha256_hex;
use crate::core::events::{EventBody, RunFailed, RunStarted, RunSucceeded};
use crate::core::ids::validate_task_id;
use crate::core::spec::{ExecutionSpec, SpecLimits, build_execution_spec};
use crate::core::types::{ExecutionOutcome, TaskState};
use crate::error::{ErrorKind, KernelError, kernel_error};
use crate::exit_codes;
use crate::guard::AttemptGuard;
use crate::io::event_store::FsEventStore;
use crate::io::evidence::{
    BundleRef, EvidenceStore, ExecutionRecord, RejectionRecord, STDERR_FILE, STDOUT_FILE,
};
use crate::io::executor::{ExecutionResult, Executor};
use crate::io::idempotency::{AttemptKey, AttemptRecord};
use crate::io::preflight::check_paths;
use crate::state::rebuild_task_state;

/// Terminal result of a run that reached the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub ok: bool,
    pub task_id: String,
    pub exec_id: String,
    pub outcome: ExecutionOutcome,
    pub reason: String,
    pub exit_code: i32,
    pub spec_sha256: String,
    pub manifest_sha256: String,
    pub stdout_sha256: String,
    pub stderr_sha256: String,
    pub outputs_manifest_sha256: String,
    pub idempotency_key: Option<String>,
    pub bundle_dir: PathBuf,
}

pub struct TaskRunner<E, G> {
    events: FsEventStore,
    evidence: EvidenceStore,
    executor: E,
    guard: G,
    limits: SpecLimits,
}

impl<E: Executor, G: AttemptGuard> TaskRunner<E, G> {
    pub fn new(
        events: FsEventStore,
        evidence: EvidenceStore,
        executor: E,
        guard: G,
        limits: SpecLimits,
    ) -> Self {
        Self {
            events,
            evidence,
            executor,
            guard,
            limits,
        }
    }

    pub fn guard(&self) -> &G {
        &self.guard
    }

    /// Execute a DISPATCHED task at most once.
    #[instrument(skip(self))]
    pub fn run_dispatched(&self, task_id: &str) -> Result<RunSummary> {
        validate_task_id(task_id)?;
        let spec = match self.load_spec(task_id) {
            Ok(spec) => spec,
            Err(err) => return Err(self.reject(task_id, None, None, err)),
        };
        let spec_sha256 = spec.spec_sha256()?;
        let key = AttemptKey::new(task_id, &spec_sha256);

        let permit = match self.guard.admit(&key) {
            Ok(permit) => permit,
            Err(err) => return Err(self.reject(task_id, Some(&spec), Some(&key), err)),
        };

        let mut started = false;
        let result = self.attempt(&spec, &spec_sha256, &key, &mut started);
        let record = match (&result, started) {
            (Ok(summary), _) => Some(AttemptRecord {
                task_id: task_id.to_string(),
                exec_identity_hash: spec_sha256.clone(),
                status: summary.outcome,
                exec_id: Some(summary.exec_id.clone()),
                manifest_sha256: Some(summary.manifest_sha256.clone()),
                reason: summary.reason.clone(),
            }),
            (Err(err), true) => Some(AttemptRecord {
                task_id: task_id.to_string(),
                exec_identity_hash: spec_sha256.clone(),
                status: ExecutionOutcome::Rejected,
                exec_id: Some(spec.exec_id.clone()),
                manifest_sha256: None,
                reason: format!("aborted:{}", refusal_reason(err)),
            }),
            (Err(_), false) => None,
        };

        let settled = self.guard.settle(permit, record.as_ref());
        match (result, settled) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), settled) => {
                if let Err(settle_err) = settled {
                    warn!(err = %format!("{settle_err:#}"), "failed to settle attempt");
                }
                Err(self.reject(task_id, Some(&spec), Some(&key), err))
            }
        }
    }

    /// Rebuild the execution spec from the task's creation record.
    fn load_spec(&self, task_id: &str) -> Result<ExecutionSpec> {
        let snapshot = rebuild_task_state(&self.events, task_id)?;
        let invalid_state = || KernelError::InvalidState {
            task_id: task_id.to_string(),
            state: snapshot.state,
        };
        if matches!(
            snapshot.state,
            TaskState::Created | TaskState::Verified | TaskState::Rejected | TaskState::Canceled
        ) {
            return Err(invalid_state().into());
        }
        let Some(created) = snapshot.created() else {
            return Err(invalid_state().into());
        };
        let verified_manifest = snapshot
            .latest_verified()
            .and_then(|verified| verified.inputs_manifest_sha256);
        let spec = build_execution_spec(task_id, &created, verified_manifest.as_deref(), self.limits)?;
        Ok(spec)
    }

    /// Everything that happens while the attempt is admitted.
    fn attempt(
        &self,
        spec: &ExecutionSpec,
        spec_sha256: &str,
        key: &AttemptKey,
        started: &mut bool,
    ) -> Result<RunSummary> {
        let task_id = spec.task_id.as_str();
        let snapshot = rebuild_task_state(&self.events, task_id)?;
        snapshot.require(TaskState::Dispatched)?;
        check_paths(spec)?;

        let run_started = self.events.append_next(
            task_id,
            snapshot.next_seq(),
            &EventBody::RunStarted(RunStarted {
                exec_id: spec.exec_id.clone(),
                spec_sha256: spec_sha256.to_string(),
                kind: spec.kind.as_str().to_string(),
            }),
        )?;
        *started = true;

        let (result, error_class) = match self.executor.run(spec) {
            Ok(result) => {
                let class = if result.timed_out {
                    ErrorKind::Timeout.as_str().to_string()
                } else {
                    "nonzero_exit".to_string()
                };
                (result, class)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "executor failed");
                let class = format!("executor_exception:{}", refusal_kind(&err));
                let result = ExecutionResult {
                    exit_code: exit_codes::EXECUTOR_EXCEPTION,
                    stderr: format!("{err:#}\n").into_bytes(),
                    ..ExecutionResult::default()
                };
                (result, class)
            }
        };

        let (outcome, reason) = if result.exit_code == 0 {
            (ExecutionOutcome::Succeeded, "exit_code:0".to_string())
        } else if error_class.starts_with("executor_exception:") {
            (ExecutionOutcome::Failed, error_class.clone())
        } else {
            (ExecutionOutcome::Failed, format!("exit_code:{}", result.exit_code))
        };

        let idempotency_key = self.guard.idempotency_key(key);
        let bundle = self.evidence.write_execution_bundle(&ExecutionRecord {
            spec,
            stdout: &result.stdout,
            stderr: &result.stderr,
            outputs: &result.outputs,
            outcome,
            reason: &reason,
            idempotency_key: idempotency_key.as_deref(),
        })?;
        let summary = summarize(spec, spec_sha256, &bundle, outcome, &reason, &result, idempotency_key);

        let body = match outcome {
            ExecutionOutcome::Succeeded => EventBody::RunSucceeded(RunSucceeded {
                exec_id: spec.exec_id.clone(),
                spec_sha256: spec_sha256.to_string(),
                exit_code: result.exit_code,
                stdout_sha256: summary.stdout_sha256.clone(),
                stderr_sha256: summary.stderr_sha256.clone(),
                outputs_manifest_sha256: summary.outputs_manifest_sha256.clone(),
                manifest_sha256: summary.manifest_sha256.clone(),
            }),
            ExecutionOutcome::Failed | ExecutionOutcome::Rejected => {
                EventBody::RunFailed(RunFailed {
                    exec_id: spec.exec_id.clone(),
                    spec_sha256: spec_sha256.to_string(),
                    exit_code: Some(result.exit_code),
                    error_class,
                    error_sha256: summary.stderr_sha256.clone(),
                    manifest_sha256: Some(summary.manifest_sha256.clone()),
                })
            }
        };
        self.events.append_next(task_id, run_started.seq + 1, &body)?;

        info!(
            exec_id = %spec.exec_id,
            outcome = %outcome,
            exit_code = result.exit_code,
            "run finished"
        );
        Ok(summary)
    }

    /// Record a refusal as a rejection bundle and hand the error back.
    fn reject(
        &self,
        task_id: &str,
        spec: Option<&ExecutionSpec>,
        key: Option<&AttemptKey>,
        err: anyhow::Error,
    ) -> anyhow::Error {
        let reason = refusal_reason(&err);
        let (prior_exec_id, prior_manifest_sha256) = match kernel_error(&err) {
            Some(KernelError::DuplicateExecution {
                prior_exec_id,
                prior_manifest_sha256,
                ..
            }) => (prior_exec_id.clone(), prior_manifest_sha256.clone()),
            _ => (None, None),
        };
        let mut context = json!({ "stage": "run" });
        if let Some(KernelError::FsmViolation { reason, .. }) = kernel_error(&err) {
            context["violation"] = json!(reason);
        }

        let rejection = RejectionRecord {
            task_id: task_id.to_string(),
            reason: reason.clone(),
            exec_id: spec.map(|s| s.exec_id.clone()),
            spec_sha256: key.map(|k| k.identity.clone()),
            idempotency_key: key.and_then(|k| self.guard.idempotency_key(k)),
            prior_exec_id,
            prior_manifest_sha256,
            context,
        };
        match self.evidence.record_rejection(&rejection) {
            Ok(bundle) => warn!(reason = %reason, dir = %bundle.dir.display(), "run refused"),
            Err(write_err) => warn!(
                reason = %reason,
                err = %format!("{write_err:#}"),
                "run refused and rejection bundle could not be written"
            ),
        }
        err
    }
}

fn summarize(
    spec: &ExecutionSpec,
    spec_sha256: &str,
    bundle: &BundleRef,
    outcome: ExecutionOutcome,
    reason: &str,
    result: &ExecutionResult,
    idempotency_key: Option<String>,
) -> RunSummary {
    let hash_of = |name: &str, bytes: &[u8]| {
        bundle
            .file_sha256(name)
            .map_or_else(|| sha256_hex(bytes), str::to_string)
    };
    RunSummary {
        ok: outcome == ExecutionOutcome::Succeeded,
        task_id: spec.task_id.clone(),
        exec_id: spec.exec_id.clone(),
        outcome,
        reason: reason.to_string(),
        exit_code: result.exit_code,
        spec_sha256: spec_sha256.to_string(),
        manifest_sha256: bundle.manifest_sha256.clone(),
        stdout_sha256: hash_of(STDOUT_FILE, &result.stdout),
        stderr_sha256: hash_of(STDERR_FILE, &result.stderr),
        outputs_manifest_sha256: bundle.outputs_manifest_sha256(),
        idempotency_key,
        bundle_dir: bundle.dir.clone(),
    }
}

/// Audit reason for any error: the kernel reason, or `runner_error`.
fn refusal_reason(err: &anyhow::Error) -> String {
    kernel_error(err).map_or_else(|| "runner_error".to_string(), KernelError::reason)
}

fn refusal_kind(err: &anyhow::Error) -> &'static str {
    kernel_error(err).map_or("io", |e| e.kind().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::event_store::EventSource;
    use crate::io::evidence::verify_bundle;
    use crate::test_support::{FailingExecutor, ScriptedExecutor, TestKernel};

    #[test]
    fn successful_run_completes_the_task() {
        let kernel = TestKernel::new();
        let task_id = kernel.dispatch_shell("t1", "e1", &["echo", "hello"]);
        let summary = kernel.runner().run_dispatched(&task_id).expect("run");

        assert!(summary.ok);
        assert_eq!(summary.exit_code, 0);
        assert_eq!(summary.reason, "exit_code:0");
        assert_eq!(summary.stdout_sha256, sha256_hex(b"hello\n"));
        assert_eq!(kernel.state(&task_id), TaskState::Completed);
        assert!(verify_bundle(&summary.bundle_dir).expect("verify").ok());

        let types: Vec<String> = kernel
            .events
            .list_events(&task_id)
            .expect("list")
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            [
                "TASK_CREATED",
                "TASK_VERIFIED",
                "TASK_DISPATCHED",
                "RUN_STARTED",
                "RUN_SUCCEEDED"
            ]
        );
    }

    #[test]
    fn nonzero_exit_fails_the_task() {
        let kernel = TestKernel::new();
        let task_id = kernel.dispatch_shell("t1", "e1", &["false"]);
        let summary = kernel.runner().run_dispatched(&task_id).expect("run");
        assert!(!summary.ok);
        assert_eq!(summary.outcome, ExecutionOutcome::Failed);
        assert_eq!(summary.reason, "exit_code:1");
        assert_eq!(kernel.state(&task_id), TaskState::Failed);
    }

    #[test]
    fn executor_exception_becomes_failed_bundle() {
        let kernel = TestKernel::new();
        let task_id = kernel.dispatch_shell("t1", "e1", &["echo", "never"]);
        let runner = kernel.runner_with(FailingExecutor);
        let summary = runner.run_dispatched(&task_id).expect("run");
        assert_eq!(summary.exit_code, exit_codes::EXECUTOR_EXCEPTION);
        assert_eq!(summary.reason, "executor_exception:io");
        assert_eq!(kernel.state(&task_id), TaskState::Failed);

        let last = kernel.events.list_events(&task_id).expect("list");
        let last = last.last().expect("event");
        assert_eq!(last.event_type, "RUN_FAILED");
        assert_eq!(last.body["exit_code"], exit_codes::EXECUTOR_EXCEPTION);
        assert_eq!(last.body["error_class"], "executor_exception:io");
    }

    #[test]
    fn task_not_dispatched_is_refused_with_bundle() {
        let kernel = TestKernel::new();
        let task_id = kernel.verify_shell("t1", "e1", &["echo", "hi"]);
        let err = kernel.runner().run_dispatched(&task_id).expect_err("refused");
        assert_eq!(
            kernel_error(&err).map(KernelError::reason).as_deref(),
            Some("invalid_state:VERIFIED")
        );
        assert!(
            kernel
                .evidence
                .rejection_dir(&task_id, "invalid_state:VERIFIED")
                .is_dir()
        );
        // Nothing was attempted, so the ledger stays open for a later run.
        kernel.route(&task_id);
        kernel.runner().run_dispatched(&task_id).expect("run after dispatch");
    }

    #[test]
    fn failure_after_start_settles_a_rejected_record() {
        let kernel = TestKernel::new();
        let task_id = kernel.dispatch_shell("t1", "e1", &["echo", "hi"]);
        // Occupy the bundle slot so sealing fails once the run has started.
        std::fs::create_dir_all(kernel.evidence.execution_dir(&task_id, "e1")).expect("occupy");

        let err = kernel.runner().run_dispatched(&task_id).expect_err("bundle exists");
        assert!(matches!(
            kernel_error(&err),
            Some(KernelError::BundleExists { .. })
        ));
        assert_eq!(kernel.state(&task_id), TaskState::Running);

        let events = kernel.events.list_events(&task_id).expect("list");
        let started = events.last().expect("event");
        assert_eq!(started.event_type, "RUN_STARTED");
        let spec_sha256 = started.body["spec_sha256"].as_str().expect("spec sha");
        let key = AttemptKey::new(task_id.as_str(), spec_sha256);
        let ledger = kernel.ledger();
        let record = ledger.load_record(&key).expect("load").expect("record");
        assert_eq!(record.status, ExecutionOutcome::Rejected);
        assert_eq!(record.exec_id.as_deref(), Some("e1"));
        assert!(record.reason.starts_with("aborted:evidence bundle already exists"));
        assert!(!ledger.lock_path(&key).exists());

        let again = kernel.runner().run_dispatched(&task_id).expect_err("duplicate");
        assert!(matches!(
            kernel_error(&again),
            Some(KernelError::DuplicateExecution { prior_exec_id: Some(id), .. }) if id == "e1"
        ));
    }

    #[test]
    fn undispatched_task_reports_state_before_payload() {
        let kernel = TestKernel::new();
        let t = crate::test_support::task("t1", "recon", "deterministic_local_execution", json!({}));
        let verified = crate::verify::verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t)
            .expect("verify");
        assert!(verified.ok);

        let err = kernel.runner().run_dispatched("t1").expect_err("refused");
        assert_eq!(
            kernel_error(&err).map(KernelError::reason).as_deref(),
            Some("invalid_state:VERIFIED")
        );
    }

    #[test]
    fn canceled_task_is_never_run() {
        let kernel = TestKernel::new();
        let task_id = kernel.dispatch_shell("t1", "e1", &["echo", "hi"]);
        crate::evaluation::cancel_task(&kernel.events, &task_id, "operator").expect("cancel");

        let err = kernel.runner().run_dispatched(&task_id).expect_err("refused");
        assert_eq!(
            kernel_error(&err).map(KernelError::reason).as_deref(),
            Some("invalid_state:CANCELED")
        );
        assert_eq!(kernel.state(&task_id), TaskState::Canceled);
    }

    #[test]
    fn scripted_executor_outputs_land_in_bundle() {
        let kernel = TestKernel::new();
        let task_id = kernel.dispatch_shell("t1", "e1", &["echo", "hi"]);
        let mut result = ExecutionResult {
            stdout: b"scripted\n".to_vec(),
            ..ExecutionResult::default()
        };
        result
            .outputs
            .insert("answer.txt".to_string(), b"42\n".to_vec());
        let runner = kernel.runner_with(ScriptedExecutor::new(result));
        let summary = runner.run_dispatched(&task_id).expect("run");
        assert!(summary.bundle_dir.join("outputs/answer.txt").is_file());
        assert_ne!(
            summary.outputs_manifest_sha256,
            crate::core::spec::canonical_inputs_manifest(&Default::default())
        );
    }
}
