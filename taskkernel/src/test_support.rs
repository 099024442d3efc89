//! Fixtures shared by unit and integration tests.
//!
//! Compiled for `cfg(test)` and behind the `test-support` feature so the
//! integration tests under `tests/` can build kernels the same way.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::canonical::sha256_hex;
use crate::core::events::{
    Event, EventBody, RunFailed, RunStarted, RunSucceeded, TaskCreated, TaskDispatched,
    TaskVerified,
};
use crate::core::policy::RoleRegistry;
use crate::core::spec::{ExecKind, ExecutionSpec, SpecLimits, canonical_inputs_manifest};
use crate::core::types::{Task, TaskState};
use crate::guard::IdempotencyGuard;
use crate::io::event_store::{EventSource, FsEventStore};
use crate::io::evidence::EvidenceStore;
use crate::io::executor::{ExecutionResult, Executor, LocalExecutor};
use crate::io::idempotency::IdempotencyLedger;
use crate::io::init::{InitOptions, KernelPaths, init_kernel};
use crate::router::ExecutionRouter;
use crate::runner::TaskRunner;
use crate::state::rebuild_task_state;
use crate::verify::verify_task;

pub const ROLE: &str = "recon";
pub const ACTION: &str = "deterministic_local_execution";

/// Inputs manifest of a task that declares no input files.
pub fn empty_inputs_manifest() -> String {
    canonical_inputs_manifest(&BTreeMap::new())
}

/// A schema-valid shell payload with a 5 second timeout and no environment.
pub fn shell_payload(exec_id: &str, argv: &[&str], cwd: &str, allowlist: &[&str]) -> Value {
    json!({
        "exec_id": exec_id,
        "kind": "shell",
        "cmd_argv": argv,
        "cwd": cwd,
        "env_allowlist": [],
        "timeout_s": 5,
        "inputs_manifest_sha256": empty_inputs_manifest(),
        "paths_allowlist": allowlist,
    })
}

pub fn sample_spec(task_id: &str, exec_id: &str) -> ExecutionSpec {
    ExecutionSpec {
        exec_id: exec_id.to_string(),
        task_id: task_id.to_string(),
        role: ROLE.to_string(),
        action: ACTION.to_string(),
        kind: ExecKind::Shell,
        cmd_argv: vec!["echo".to_string(), "hi".to_string()],
        cwd: "/tmp/work".to_string(),
        env_allowlist: Vec::new(),
        timeout_s: 5,
        inputs_manifest_sha256: empty_inputs_manifest(),
        paths_allowlist: vec!["/tmp/work".to_string()],
        note: None,
    }
}

pub fn task(task_id: &str, role: &str, action: &str, payload: Value) -> Task {
    Task {
        task_id: task_id.to_string(),
        role: role.to_string(),
        action: action.to_string(),
        payload,
        attempt: 0,
    }
}

/// CREATED, VERIFIED, DISPATCHED, RUN_STARTED, RUN_SUCCEEDED for a recon task.
pub fn lifecycle_bodies() -> Vec<EventBody> {
    let manifest = empty_inputs_manifest();
    let spec_sha256 = "a".repeat(64);
    vec![
        EventBody::TaskCreated(TaskCreated {
            role: ROLE.to_string(),
            action: ACTION.to_string(),
            payload: shell_payload("e1", &["echo", "hi"], "/tmp/work", &["/tmp/work"]),
            attempt: 0,
        }),
        EventBody::TaskVerified(TaskVerified {
            role: ROLE.to_string(),
            action: ACTION.to_string(),
            attempt: 0,
            inputs_manifest_sha256: Some(manifest.clone()),
        }),
        EventBody::TaskDispatched(TaskDispatched {
            role: ROLE.to_string(),
            action: ACTION.to_string(),
            attempt: 0,
            inputs_manifest_sha256: Some(manifest),
        }),
        EventBody::RunStarted(RunStarted {
            exec_id: "e1".to_string(),
            spec_sha256: spec_sha256.clone(),
            kind: "shell".to_string(),
        }),
        EventBody::RunSucceeded(RunSucceeded {
            exec_id: "e1".to_string(),
            spec_sha256,
            exit_code: 0,
            stdout_sha256: sha256_hex(b"hi\n"),
            stderr_sha256: sha256_hex(b""),
            outputs_manifest_sha256: "b".repeat(64),
            manifest_sha256: "c".repeat(64),
        }),
    ]
}

pub fn run_failed_body() -> EventBody {
    EventBody::RunFailed(RunFailed {
        exec_id: "e1".to_string(),
        spec_sha256: "a".repeat(64),
        exit_code: Some(1),
        error_class: "nonzero_exit".to_string(),
        error_sha256: sha256_hex(b"boom\n"),
        manifest_sha256: Some("c".repeat(64)),
    })
}

/// Seal `bodies` into a linked chain with strictly increasing timestamps.
pub fn event_chain(task_id: &str, bodies: &[EventBody]) -> Vec<Event> {
    let mut prev_hash = None;
    bodies
        .iter()
        .enumerate()
        .map(|(i, body)| {
            let timestamp = format!("2026-01-01T00:00:{i:02}.000000Z");
            let event = Event::seal(task_id, i as u64, timestamp, body, prev_hash.take())
                .expect("seal event");
            prev_hash = Some(event.hash.clone());
            event
        })
        .collect()
}

/// In-memory event source. Events are returned in insertion order.
#[derive(Debug, Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<Event>>,
}

impl MemoryEvents {
    pub fn from_events(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }
}

impl EventSource for MemoryEvents {
    fn list_events(&self, task_id: &str) -> Result<Vec<Event>> {
        let events = self.events.lock().map_err(|_| anyhow!("poisoned"))?;
        Ok(events
            .iter()
            .filter(|event| event.task_id == task_id)
            .cloned()
            .collect())
    }
}

/// Returns the same result for every run and counts calls.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    result: ExecutionResult,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(result: ExecutionResult) -> Self {
        Self {
            result,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Executor for ScriptedExecutor {
    fn run(&self, _spec: &ExecutionSpec) -> Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

/// Fails every run as if the backend itself broke.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingExecutor;

impl Executor for FailingExecutor {
    fn run(&self, _spec: &ExecutionSpec) -> Result<ExecutionResult> {
        Err(anyhow!("executor backend unavailable"))
    }
}

/// An initialized kernel root in a temporary directory plus a work dir that
/// shell payloads may use as `cwd`.
pub struct TestKernel {
    _temp: TempDir,
    pub paths: KernelPaths,
    pub work: PathBuf,
    pub events: FsEventStore,
    pub evidence: EvidenceStore,
    pub roles: RoleRegistry,
    pub limits: SpecLimits,
}

impl Default for TestKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl TestKernel {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_kernel(temp.path(), &InitOptions { force: false }).expect("init");
        let work = temp.path().join("work");
        std::fs::create_dir_all(&work).expect("work dir");
        Self {
            events: FsEventStore::new(&paths.events_dir),
            evidence: EvidenceStore::new(&paths.evidence_dir),
            roles: RoleRegistry::canonical(),
            limits: SpecLimits { max_timeout_s: 60 },
            work,
            paths,
            _temp: temp,
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn ledger(&self) -> IdempotencyLedger {
        IdempotencyLedger::new(&self.paths.locks_dir, &self.paths.records_dir)
    }

    pub fn runner(&self) -> TaskRunner<LocalExecutor, IdempotencyGuard> {
        self.runner_with(LocalExecutor::new(1024 * 1024))
    }

    pub fn runner_with<E: Executor>(&self, executor: E) -> TaskRunner<E, IdempotencyGuard> {
        TaskRunner::new(
            self.events.clone(),
            self.evidence.clone(),
            executor,
            IdempotencyGuard::new(self.ledger()),
            self.limits,
        )
    }

    /// Shell payload confined to the work dir, with `PATH` passed through.
    pub fn work_payload(&self, exec_id: &str, argv: &[&str]) -> Value {
        let work = self.work.display().to_string();
        let mut payload = shell_payload(exec_id, argv, &work, &[&work]);
        payload["env_allowlist"] = json!(["PATH"]);
        payload
    }

    pub fn shell_task(&self, task_id: &str, exec_id: &str, argv: &[&str]) -> Task {
        task(task_id, ROLE, ACTION, self.work_payload(exec_id, argv))
    }

    /// Declare and verify a shell task. Returns its id.
    pub fn verify_shell(&self, task_id: &str, exec_id: &str, argv: &[&str]) -> String {
        let t = self.shell_task(task_id, exec_id, argv);
        let verified = verify_task(&self.events, &self.evidence, &self.roles, &t).expect("verify");
        assert!(verified.ok, "verification refused: {}", verified.reason);
        t.task_id
    }

    /// Declare, verify and dispatch a shell task. Returns its id.
    pub fn dispatch_shell(&self, task_id: &str, exec_id: &str, argv: &[&str]) -> String {
        let task_id = self.verify_shell(task_id, exec_id, argv);
        self.route(&task_id);
        task_id
    }

    /// Route a verified task using its recorded role and action.
    pub fn route(&self, task_id: &str) {
        let snapshot = rebuild_task_state(&self.events, task_id).expect("rebuild");
        let created = snapshot.created().expect("task created");
        let t = task(task_id, &created.role, &created.action, created.payload);
        let routed = ExecutionRouter::new(&self.events, &self.roles)
            .route(&t)
            .expect("route");
        assert!(routed.ok, "route refused: {}", routed.reason);
    }

    pub fn state(&self, task_id: &str) -> TaskState {
        rebuild_task_state(&self.events, task_id)
            .expect("rebuild")
            .state
    }
}
