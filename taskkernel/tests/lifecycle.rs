//! End-to-end task lifecycles against a real kernel root.
//!
//! Each test builds a fresh root with `TestKernel`, drives verification,
//! routing and execution through the public API, then checks the event log,
//! ledger and evidence bundles on disk.

use std::fs;

use serde_json::{Value, json};

use taskkernel::core::canonical::sha256_hex;
use taskkernel::core::types::{EvalDecision, ExecutionOutcome, TaskState};
use taskkernel::error::{ErrorKind, KernelError, kernel_error};
use taskkernel::evaluation::evaluate_task;
use taskkernel::exit_codes;
use taskkernel::io::event_store::EventSource;
use taskkernel::io::evidence::{REJECTION_FILE, verify_bundle};
use taskkernel::io::idempotency::AttemptKey;
use taskkernel::state::rebuild_task_state;
use taskkernel::test_support::{TestKernel, task};
use taskkernel::verify::verify_task;

fn reason(err: &anyhow::Error) -> Option<String> {
    kernel_error(err).map(KernelError::reason)
}

fn event_types(kernel: &TestKernel, task_id: &str) -> Vec<String> {
    kernel
        .events
        .list_events(task_id)
        .expect("list")
        .into_iter()
        .map(|event| event.event_type)
        .collect()
}

fn read_rejection(kernel: &TestKernel, task_id: &str, reason: &str) -> Value {
    let dir = kernel.evidence.rejection_dir(task_id, reason);
    let raw = fs::read_to_string(dir.join(REJECTION_FILE)).expect("rejection.json");
    serde_json::from_str(&raw).expect("parse rejection")
}

#[test]
fn happy_path_runs_once_and_is_evaluated() {
    let kernel = TestKernel::new();
    let task_id = kernel.dispatch_shell("t_happy", "e1", &["echo", "hello"]);
    let summary = kernel.runner().run_dispatched(&task_id).expect("run");

    assert!(summary.ok);
    assert_eq!(summary.outcome, ExecutionOutcome::Succeeded);
    assert_eq!(summary.stdout_sha256, sha256_hex(b"hello\n"));
    assert!(verify_bundle(&summary.bundle_dir).expect("bundle").ok());
    kernel.events.check_chain(&task_id).expect("chain");

    let evaluation = evaluate_task(
        &kernel.events,
        &kernel.evidence,
        &task_id,
        EvalDecision::Accept,
        Some("looks right"),
    )
    .expect("evaluate");
    assert_eq!(evaluation.exec_id, "e1");
    assert_eq!(kernel.state(&task_id), TaskState::Evaluated);
    assert_eq!(
        event_types(&kernel, &task_id),
        [
            "TASK_CREATED",
            "TASK_VERIFIED",
            "TASK_DISPATCHED",
            "RUN_STARTED",
            "RUN_SUCCEEDED",
            "TASK_EVALUATED"
        ]
    );
}

#[test]
fn retry_after_success_is_rejected_with_linkage() {
    let kernel = TestKernel::new();
    let task_id = kernel.dispatch_shell("t_retry", "e1", &["echo", "once"]);
    let first = kernel.runner().run_dispatched(&task_id).expect("first run");

    let err = kernel.runner().run_dispatched(&task_id).expect_err("second run");
    assert_eq!(reason(&err).as_deref(), Some("duplicate_execution"));
    assert_eq!(kernel.state(&task_id), TaskState::Completed);

    let dir = kernel.evidence.rejection_dir(&task_id, "duplicate_execution");
    assert!(dir.ends_with(&sha256_hex("duplicate_execution")[..16]));
    let rejection = read_rejection(&kernel, &task_id, "duplicate_execution");
    assert_eq!(rejection["prior_exec_id"], "e1");
    assert_eq!(rejection["prior_manifest_sha256"], json!(first.manifest_sha256));
    assert_eq!(rejection["idempotency_key"], json!(first.spec_sha256));
    assert!(verify_bundle(&dir).expect("rejection bundle").ok());

    // Exactly one RUN_STARTED ever.
    let started = event_types(&kernel, &task_id)
        .into_iter()
        .filter(|ty| ty == "RUN_STARTED")
        .count();
    assert_eq!(started, 1);
}

#[cfg(unix)]
#[test]
fn timeout_fails_the_task_and_is_never_retried() {
    let kernel = TestKernel::new();
    let mut t = kernel.shell_task("t_timeout", "e1", &["sleep", "5"]);
    t.payload["timeout_s"] = json!(1);
    let verified = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("verify");
    assert!(verified.ok);
    kernel.route(&t.task_id);

    let summary = kernel.runner().run_dispatched(&t.task_id).expect("run");
    assert!(!summary.ok);
    assert_eq!(summary.exit_code, exit_codes::TIMEOUT);
    assert_eq!(summary.reason, format!("exit_code:{}", exit_codes::TIMEOUT));
    assert_eq!(kernel.state(&t.task_id), TaskState::Failed);

    let events = kernel.events.list_events(&t.task_id).expect("list");
    let failed = events.last().expect("last event");
    assert_eq!(failed.event_type, "RUN_FAILED");
    assert_eq!(failed.body["error_class"], "timeout");

    let err = kernel.runner().run_dispatched(&t.task_id).expect_err("retry");
    assert_eq!(reason(&err).as_deref(), Some("duplicate_execution"));
    let rejection = read_rejection(&kernel, &t.task_id, "duplicate_execution");
    assert_eq!(rejection["prior_exec_id"], "e1");
}

#[cfg(unix)]
#[test]
fn timeout_reaches_processes_the_command_started() {
    let kernel = TestKernel::new();
    let mut t = kernel.shell_task("t_grandchild", "e1", &["sh", "-c", "sleep 30; true"]);
    t.payload["timeout_s"] = json!(1);
    let verified = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("verify");
    assert!(verified.ok);
    kernel.route(&t.task_id);

    let started = std::time::Instant::now();
    let summary = kernel.runner().run_dispatched(&t.task_id).expect("run");
    assert!(started.elapsed() < std::time::Duration::from_secs(15), "{:?}", started.elapsed());
    assert_eq!(summary.exit_code, exit_codes::TIMEOUT);
    assert_eq!(kernel.state(&t.task_id), TaskState::Failed);
}

#[test]
fn failed_run_is_recorded_in_ledger() {
    let kernel = TestKernel::new();
    let task_id = kernel.dispatch_shell("t_fail", "e1", &["false"]);
    let summary = kernel.runner().run_dispatched(&task_id).expect("run");
    assert_eq!(summary.outcome, ExecutionOutcome::Failed);

    let record = kernel
        .ledger()
        .load_record(&AttemptKey::new(&task_id, &summary.spec_sha256))
        .expect("load")
        .expect("record");
    assert_eq!(record.status, ExecutionOutcome::Failed);
    assert_eq!(record.manifest_sha256.as_deref(), Some(summary.manifest_sha256.as_str()));
}

#[test]
fn run_without_dispatch_is_invalid_state() {
    let kernel = TestKernel::new();
    let task_id = kernel.verify_shell("t_early", "e1", &["echo", "hi"]);
    let err = kernel.runner().run_dispatched(&task_id).expect_err("not dispatched");
    assert_eq!(reason(&err).as_deref(), Some("invalid_state:VERIFIED"));
    assert!(!event_types(&kernel, &task_id).contains(&"RUN_STARTED".to_string()));

    let rejection = read_rejection(&kernel, &task_id, "invalid_state:VERIFIED");
    assert_eq!(rejection["outcome"], "REJECTED");
}

#[test]
fn policy_denial_leaves_only_a_rejection() {
    let kernel = TestKernel::new();
    let payload = kernel.work_payload("e1", &["echo", "hi"]);
    let t = task("t_scout", "scout", "local_execution", payload);
    let verified = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("verify");

    assert!(!verified.ok);
    assert_eq!(verified.reason, "deny:prohibited:scout:local_execution");
    assert!(kernel.events.list_events("t_scout").expect("list").is_empty());
    let dir = kernel.evidence.rejection_dir("t_scout", &verified.reason);
    assert!(verify_bundle(&dir).expect("rejection bundle").ok());
}

#[test]
fn path_outside_allowlist_is_refused_before_run_started() {
    let kernel = TestKernel::new();
    let task_id = kernel.dispatch_shell("t_path", "e1", &["cat", "/etc/passwd"]);
    let err = kernel.runner().run_dispatched(&task_id).expect_err("path");
    let expected = "arg_path_not_allowlisted:/etc/passwd";
    assert_eq!(reason(&err).as_deref(), Some(expected));
    assert_eq!(kernel.state(&task_id), TaskState::Dispatched);
    assert!(kernel.evidence.rejection_dir(&task_id, expected).is_dir());
    assert!(!kernel.evidence.execution_dir(&task_id, "e1").exists());
}

#[test]
fn unsupported_kind_is_refused_without_lock() {
    let kernel = TestKernel::new();
    let mut t = kernel.shell_task("t_kind", "e1", &["echo", "hi"]);
    t.payload["kind"] = json!("python");
    let verified = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("verify");
    assert!(verified.ok);
    kernel.route(&t.task_id);

    let err = kernel.runner().run_dispatched(&t.task_id).expect_err("kind");
    assert_eq!(
        kernel_error(&err).map(KernelError::kind),
        Some(ErrorKind::UnsupportedKind)
    );
    assert!(
        kernel
            .evidence
            .rejection_dir(&t.task_id, "unsupported_execution_kind:python")
            .is_dir()
    );
    assert_eq!(fs::read_dir(&kernel.paths.locks_dir).expect("locks").count(), 0);
}

#[test]
fn tampered_bundle_fails_integrity_check() {
    let kernel = TestKernel::new();
    let task_id = kernel.dispatch_shell("t_tamper", "e1", &["echo", "original"]);
    let summary = kernel.runner().run_dispatched(&task_id).expect("run");

    fs::write(summary.bundle_dir.join("stdout.txt"), b"forged\n").expect("tamper");
    let report = verify_bundle(&summary.bundle_dir).expect("verify");
    assert!(!report.ok());
    assert!(report.problems.iter().any(|p| p.contains("stdout.txt")));
}

#[test]
fn tampered_event_blocks_replay() {
    let kernel = TestKernel::new();
    let task_id = kernel.dispatch_shell("t_chain", "e1", &["echo", "hi"]);
    let path = kernel.events.event_path(&task_id, 1);
    let raw = fs::read_to_string(&path).expect("read");
    fs::write(&path, raw.replacen("recon", "recoN", 1)).expect("tamper");

    let err = rebuild_task_state(&kernel.events, &task_id).expect_err("tampered");
    assert_eq!(
        kernel_error(&err).map(KernelError::kind),
        Some(ErrorKind::ChainMismatch)
    );
    let err = kernel.runner().run_dispatched(&task_id).expect_err("refused");
    assert!(reason(&err).is_some_and(|r| r.starts_with("chain_mismatch:")));
}
