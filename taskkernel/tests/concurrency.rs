//! Racing callers against one kernel root.

use std::sync::Barrier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use taskkernel::core::spec::ExecutionSpec;
use taskkernel::core::types::TaskState;
use taskkernel::error::{ErrorKind, kernel_error};
use taskkernel::evaluation::cancel_task;
use taskkernel::io::event_store::EventSource;
use taskkernel::io::executor::{ExecutionResult, Executor};
use taskkernel::router::ExecutionRouter;
use taskkernel::state::rebuild_task_state;
use taskkernel::test_support::{TestKernel, lifecycle_bodies};

const CALLERS: usize = 8;
const ROUNDS: usize = 25;

fn is_event_exists(err: &anyhow::Error) -> bool {
    kernel_error(err).map(|e| e.kind()) == Some(ErrorKind::EventExists)
}

fn count_events(kernel: &TestKernel, task_id: &str, event_type: &str) -> usize {
    kernel
        .events
        .list_events(task_id)
        .expect("list")
        .iter()
        .filter(|event| event.event_type == event_type)
        .count()
}

/// Holds the attempt open long enough for the other callers to collide.
#[derive(Default)]
struct SlowExecutor {
    calls: AtomicUsize,
}

impl Executor for SlowExecutor {
    fn run(&self, _spec: &ExecutionSpec) -> Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        Ok(ExecutionResult {
            stdout: b"slow\n".to_vec(),
            ..ExecutionResult::default()
        })
    }
}

#[test]
fn concurrent_runs_execute_exactly_once() {
    let kernel = TestKernel::new();
    let task_id = kernel.dispatch_shell("t_race", "e1", &["echo", "hi"]);
    let executor = SlowExecutor::default();

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let runner = kernel.runner_with(&executor);
                let task_id = task_id.as_str();
                scope.spawn(move || runner.run_dispatched(task_id))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect()
    });

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        let kind = kernel_error(err).map(|e| e.kind());
        assert!(
            matches!(
                kind,
                Some(ErrorKind::LockHeld | ErrorKind::DuplicateExecution)
            ),
            "unexpected refusal: {err:#}"
        );
    }
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    let started = kernel
        .events
        .list_events(&task_id)
        .expect("list")
        .iter()
        .filter(|event| event.event_type == "RUN_STARTED")
        .count();
    assert_eq!(started, 1);
    kernel.events.check_chain(&task_id).expect("chain");
}

#[test]
fn concurrent_appends_never_share_a_sequence_number() {
    let kernel = TestKernel::new();
    let body = lifecycle_bodies().remove(0);

    let appended: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let events = &kernel.events;
                let body = &body;
                scope.spawn(move || {
                    (0..4)
                        .filter_map(|_| events.append_event("t_append", body).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("join"))
            .collect()
    });

    let mut seqs: Vec<u64> = appended.iter().map(|event| event.seq).collect();
    seqs.sort_unstable();
    let expected: Vec<u64> = (0..seqs.len() as u64).collect();
    assert_eq!(seqs, expected);
    assert!(!seqs.is_empty());
    assert!(kernel.events.verify_chain("t_append").expect("verify"));
}

#[test]
fn concurrent_routes_dispatch_exactly_once() {
    let kernel = TestKernel::new();
    for round in 0..ROUNDS {
        let task_id = format!("t_route_{round}");
        let task = kernel.shell_task(&task_id, "e1", &["echo", "hi"]);
        kernel.verify_shell(&task_id, "e1", &["echo", "hi"]);
        let barrier = Barrier::new(CALLERS);

        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    let (kernel, task, barrier) = (&kernel, &task, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        ExecutionRouter::new(&kernel.events, &kernel.roles).route(task)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .collect()
        });

        let dispatched = results
            .iter()
            .filter(|r| r.as_ref().is_ok_and(|routed| routed.ok))
            .count();
        assert_eq!(dispatched, 1, "round {round}");
        for result in &results {
            match result {
                Ok(routed) if !routed.ok => {
                    assert_eq!(routed.reason, "invalid_state:DISPATCHED");
                }
                Ok(_) => {}
                Err(err) => assert!(is_event_exists(err), "unexpected error: {err:#}"),
            }
        }

        let snapshot = rebuild_task_state(&kernel.events, &task_id).expect("rebuild");
        assert_eq!(snapshot.state, TaskState::Dispatched);
        assert_eq!(count_events(&kernel, &task_id, "TASK_DISPATCHED"), 1);
        kernel.events.check_chain(&task_id).expect("chain");
    }
}

#[test]
fn cancel_racing_a_run_leaves_a_replayable_log() {
    let kernel = TestKernel::new();
    for round in 0..ROUNDS {
        let task_id = kernel.dispatch_shell(&format!("t_cancel_{round}"), "e1", &["echo", "hi"]);
        let barrier = Barrier::new(2);

        let (run, cancel) = thread::scope(|scope| {
            let run = scope.spawn(|| {
                barrier.wait();
                kernel.runner().run_dispatched(&task_id)
            });
            let cancel = scope.spawn(|| {
                barrier.wait();
                cancel_task(&kernel.events, &task_id, "operator")
            });
            (
                run.join().expect("join run"),
                cancel.join().expect("join cancel"),
            )
        });

        let snapshot = rebuild_task_state(&kernel.events, &task_id).expect("rebuild");
        match snapshot.state {
            TaskState::Completed => {
                assert!(run.is_ok());
                assert!(cancel.is_err());
            }
            TaskState::Canceled => {
                assert!(run.is_err());
                assert!(cancel.is_ok());
                assert_eq!(count_events(&kernel, &task_id, "RUN_STARTED"), 0);
            }
            other => panic!("round {round}: unexpected state {other}"),
        }
        kernel.events.check_chain(&task_id).expect("chain");
    }
}
