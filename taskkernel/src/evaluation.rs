//! Post-run decisions: evaluation, refinement and cancellation.
//!
//! EVALUATED is terminal. A `refine` verdict does not reopen the task; it
//! names a child task that [`create_refinement_task`] declares and verifies
//! with lineage back to the parent run.
//!
//! Child ids are `refine::<parent>::<run>`, where `<parent>` is the first 16
//! hex digits of the parent id's sha256 and `<run>` the first 16 of the run
//! spec hash. The id stays the same length however deep the chain goes; the
//! full parent id lives in the child's `lineage_parent_task_id`.

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::core::canonical::{canonical_sha256, sha256_hex};
use crate::core::events::{EventBody, TaskCanceled, TaskEvaluated};
use crate::core::ids::{validate_exec_id, validate_task_id};
use crate::core::policy::RoleRegistry;
use crate::core::types::{EvalDecision, Task, TaskState};
use crate::error::KernelError;
use crate::io::event_store::{EventRef, EventSource, FsEventStore};
use crate::io::evidence::EvidenceStore;
use crate::state::{TaskSnapshot, rebuild_task_state};
use crate::verify::verify_task;

pub const EVALUATION_REASON: &str = "task_evaluation";
pub const REFINEMENT_REASON: &str = "refinement_task_created";

const REFINE_ID_HEX: usize = 16;

/// Id of the child task a `refine` verdict names.
pub fn refinement_task_id(task_id: &str, run_spec_sha256: &str) -> String {
    let parent = sha256_hex(task_id);
    let run = run_spec_sha256
        .get(..REFINE_ID_HEX)
        .unwrap_or(run_spec_sha256);
    format!("refine::{}::{run}", &parent[..REFINE_ID_HEX])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub task_id: String,
    pub decision: EvalDecision,
    pub exec_id: String,
    pub evaluation_spec_sha256: String,
    pub evaluation_manifest_sha256: String,
    pub refinement_task_id: Option<String>,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Refinement {
    pub parent_task_id: String,
    pub refinement_task_id: String,
    pub create_spec_sha256: String,
    pub create_manifest_sha256: String,
}

fn invalid_state(snapshot: &TaskSnapshot) -> KernelError {
    KernelError::InvalidState {
        task_id: snapshot.task_id.clone(),
        state: snapshot.state,
    }
}

fn invalid_payload(detail: impl Into<String>) -> KernelError {
    KernelError::InvalidPayload {
        detail: detail.into(),
    }
}

/// Record a verdict on the latest successful run of a COMPLETED task.
#[instrument(skip_all, fields(task_id = %task_id, decision = %decision.as_str()))]
pub fn evaluate_task(
    events: &FsEventStore,
    evidence: &EvidenceStore,
    task_id: &str,
    decision: EvalDecision,
    note: Option<&str>,
) -> Result<Evaluation> {
    validate_task_id(task_id)?;
    let note = note.map(str::trim).filter(|n| !n.is_empty());
    if decision == EvalDecision::Refine && note.is_none() {
        return Err(invalid_payload("refine_requires_note").into());
    }

    let snapshot = rebuild_task_state(events, task_id)?;
    snapshot.require(TaskState::Completed)?;
    let run = snapshot
        .latest_run_succeeded()
        .ok_or_else(|| invalid_state(&snapshot))?;

    let summary = evidence.read_execution_summary(task_id, &run.exec_id)?;
    if summary.manifest_sha256 != run.manifest_sha256 {
        let seq = snapshot.history.last().map_or(0, |e| e.seq);
        return Err(KernelError::ChainMismatch {
            task_id: task_id.to_string(),
            seq,
            detail: "run manifest differs from evidence bundle".to_string(),
        }
        .into());
    }

    let refinement = (decision == EvalDecision::Refine)
        .then(|| refinement_task_id(task_id, &run.spec_sha256));
    if let Some(child_id) = &refinement {
        validate_task_id(child_id)?;
    }
    let spec = json!({
        "kind": EVALUATION_REASON,
        "task_id": task_id,
        "exec_id": run.exec_id,
        "decision": decision,
        "note": note,
        "run_spec_sha256": run.spec_sha256,
        "run_manifest_sha256": summary.manifest_sha256,
        "refinement_task_id": refinement,
    });
    let evaluation_spec_sha256 = canonical_sha256(&spec)?;
    let bundle =
        evidence.write_verification_bundle(&evaluation_spec_sha256, &spec, EVALUATION_REASON)?;

    let event = events.append_next(
        task_id,
        snapshot.next_seq(),
        &EventBody::TaskEvaluated(TaskEvaluated {
            decision,
            note: note.map(str::to_string),
            exec_id: run.exec_id.clone(),
            run_spec_sha256: run.spec_sha256,
            run_manifest_sha256: summary.manifest_sha256,
            evaluation_spec_sha256: evaluation_spec_sha256.clone(),
            evaluation_manifest_sha256: bundle.manifest_sha256.clone(),
            refinement_task_id: refinement.clone(),
        }),
    )?;
    info!(seq = event.seq, "task evaluated");

    Ok(Evaluation {
        task_id: task_id.to_string(),
        decision,
        exec_id: run.exec_id,
        evaluation_spec_sha256,
        evaluation_manifest_sha256: bundle.manifest_sha256,
        refinement_task_id: refinement,
        seq: event.seq,
    })
}

/// Declare and verify the child task named by a parent's `refine` verdict.
///
/// The child keeps the parent's role, action and payload, runs under
/// `exec_id`, and carries `lineage_*` fields pointing at the parent run.
#[instrument(skip(events, evidence, roles))]
pub fn create_refinement_task(
    events: &FsEventStore,
    evidence: &EvidenceStore,
    roles: &RoleRegistry,
    parent_task_id: &str,
    exec_id: &str,
) -> Result<Refinement> {
    validate_task_id(parent_task_id)?;
    validate_exec_id(exec_id)?;

    let parent = rebuild_task_state(events, parent_task_id)?;
    parent.require(TaskState::Evaluated)?;
    let verdict = parent
        .latest_evaluated()
        .ok_or_else(|| invalid_state(&parent))?;
    if verdict.decision != EvalDecision::Refine {
        return Err(invalid_payload("parent_not_refine").into());
    }
    let Some(note) = verdict.note.as_deref() else {
        return Err(invalid_payload("refine_requires_note").into());
    };
    let child_id = refinement_task_id(parent_task_id, &verdict.run_spec_sha256);
    if verdict.refinement_task_id.as_deref() != Some(child_id.as_str()) {
        return Err(invalid_payload("refinement_task_id_mismatch").into());
    }
    if !events.list_events(&child_id)?.is_empty() {
        return Err(KernelError::DuplicateRefinement { task_id: child_id }.into());
    }

    let created = parent.created().ok_or_else(|| invalid_state(&parent))?;
    let Value::Object(mut payload) = created.payload else {
        return Err(invalid_payload("parent payload is not an object").into());
    };
    let note_sha256 = sha256_hex(note);
    let lineage = [
        ("lineage_parent_task_id", parent_task_id),
        ("lineage_parent_exec_id", verdict.exec_id.as_str()),
        ("lineage_parent_run_spec_sha256", verdict.run_spec_sha256.as_str()),
        ("lineage_parent_run_manifest_sha256", verdict.run_manifest_sha256.as_str()),
        (
            "lineage_parent_evaluation_spec_sha256",
            verdict.evaluation_spec_sha256.as_str(),
        ),
        ("lineage_refinement_note", note),
        ("lineage_refinement_note_sha256", note_sha256.as_str()),
    ];
    for (field, value) in lineage {
        payload.insert(field.to_string(), json!(value));
    }
    payload.insert("exec_id".to_string(), json!(exec_id));

    let spec = json!({
        "kind": REFINEMENT_REASON,
        "refinement_task_id": child_id,
        "parent_task_id": parent_task_id,
        "parent_exec_id": verdict.exec_id,
        "parent_run_spec_sha256": verdict.run_spec_sha256,
        "parent_run_manifest_sha256": verdict.run_manifest_sha256,
        "parent_evaluation_spec_sha256": verdict.evaluation_spec_sha256,
        "refinement_note_sha256": note_sha256,
        "role": created.role,
        "action": created.action,
        "exec_id": exec_id,
    });
    let create_spec_sha256 = canonical_sha256(&spec)?;
    let bundle =
        evidence.write_verification_bundle(&create_spec_sha256, &spec, REFINEMENT_REASON)?;

    let child = Task {
        task_id: child_id.clone(),
        role: created.role,
        action: created.action,
        payload: Value::Object(payload),
        attempt: 0,
    };
    let verified = verify_task(events, evidence, roles, &child)?;
    if !verified.ok {
        return Err(invalid_payload(format!(
            "refinement_task_verify_failed:{}",
            verified.reason
        ))
        .into());
    }
    info!(child = %child_id, "refinement task created");

    Ok(Refinement {
        parent_task_id: parent_task_id.to_string(),
        refinement_task_id: child_id,
        create_spec_sha256,
        create_manifest_sha256: bundle.manifest_sha256,
    })
}

/// Close a task that has not started running.
#[instrument(skip(events))]
pub fn cancel_task(events: &FsEventStore, task_id: &str, reason: &str) -> Result<EventRef> {
    validate_task_id(task_id)?;
    let snapshot = rebuild_task_state(events, task_id)?;
    if !matches!(
        snapshot.state,
        TaskState::Created | TaskState::Verified | TaskState::Dispatched
    ) || snapshot.history.is_empty()
    {
        return Err(invalid_state(&snapshot).into());
    }
    let event = events.append_next(
        task_id,
        snapshot.next_seq(),
        &EventBody::TaskCanceled(TaskCanceled {
            reason: reason.to_string(),
        }),
    )?;
    info!(seq = event.seq, "task canceled");
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kernel_error;
    use crate::io::evidence::verify_bundle;
    use crate::test_support::TestKernel;

    fn completed(kernel: &TestKernel) -> String {
        let task_id = kernel.dispatch_shell("t1", "e1", &["echo", "done"]);
        let summary = kernel.runner().run_dispatched(&task_id).expect("run");
        assert!(summary.ok);
        task_id
    }

    fn reason(err: &anyhow::Error) -> Option<String> {
        kernel_error(err).map(KernelError::reason)
    }

    #[test]
    fn accept_moves_task_to_evaluated() {
        let kernel = TestKernel::new();
        let task_id = completed(&kernel);
        let evaluation =
            evaluate_task(&kernel.events, &kernel.evidence, &task_id, EvalDecision::Accept, None)
                .expect("evaluate");

        assert_eq!(evaluation.refinement_task_id, None);
        assert_eq!(kernel.state(&task_id), TaskState::Evaluated);
        let dir = kernel
            .evidence
            .verification_dir(&evaluation.evaluation_spec_sha256);
        let report = verify_bundle(&dir).expect("verify bundle");
        assert_eq!(report.manifest_sha256, evaluation.evaluation_manifest_sha256);
    }

    #[test]
    fn evaluation_requires_completed_task() {
        let kernel = TestKernel::new();
        let task_id = kernel.dispatch_shell("t1", "e1", &["echo", "hi"]);
        let err =
            evaluate_task(&kernel.events, &kernel.evidence, &task_id, EvalDecision::Accept, None)
                .expect_err("not completed");
        assert_eq!(reason(&err).as_deref(), Some("invalid_state:DISPATCHED"));
    }

    #[test]
    fn refine_requires_a_note() {
        let kernel = TestKernel::new();
        let task_id = completed(&kernel);
        let err = evaluate_task(
            &kernel.events,
            &kernel.evidence,
            &task_id,
            EvalDecision::Refine,
            Some("  "),
        )
        .expect_err("note");
        assert_eq!(reason(&err).as_deref(), Some("invalid_payload:refine_requires_note"));
        assert_eq!(kernel.state(&task_id), TaskState::Completed);
    }

    #[test]
    fn refinement_creates_verified_child_once() {
        let kernel = TestKernel::new();
        let task_id = completed(&kernel);
        let evaluation = evaluate_task(
            &kernel.events,
            &kernel.evidence,
            &task_id,
            EvalDecision::Refine,
            Some("tighten output"),
        )
        .expect("evaluate");
        let child_id = evaluation.refinement_task_id.expect("child id");
        assert_eq!(child_id, refinement_task_id("t1", &evaluation_run_spec(&kernel, "t1")));
        assert!(child_id.starts_with(&format!("refine::{}::", &sha256_hex("t1")[..16])));

        let refinement =
            create_refinement_task(&kernel.events, &kernel.evidence, &kernel.roles, &task_id, "e2")
                .expect("refine");
        assert_eq!(refinement.refinement_task_id, child_id);
        assert_eq!(kernel.state(&child_id), TaskState::Verified);

        let child = rebuild_task_state(&kernel.events, &child_id).expect("child");
        let payload = child.created().expect("created").payload;
        assert_eq!(payload["exec_id"], "e2");
        assert_eq!(payload["lineage_parent_task_id"], "t1");
        assert_eq!(payload["lineage_parent_exec_id"], "e1");

        let err =
            create_refinement_task(&kernel.events, &kernel.evidence, &kernel.roles, &task_id, "e3")
                .expect_err("duplicate");
        assert_eq!(
            kernel_error(&err).map(KernelError::kind),
            Some(crate::error::ErrorKind::DuplicateRefinement)
        );
    }

    #[test]
    fn accepted_parent_cannot_be_refined() {
        let kernel = TestKernel::new();
        let task_id = completed(&kernel);
        evaluate_task(&kernel.events, &kernel.evidence, &task_id, EvalDecision::Accept, None)
            .expect("evaluate");
        let err =
            create_refinement_task(&kernel.events, &kernel.evidence, &kernel.roles, &task_id, "e2")
                .expect_err("accepted");
        assert_eq!(reason(&err).as_deref(), Some("invalid_payload:parent_not_refine"));
    }

    #[test]
    fn cancel_only_before_running() {
        let kernel = TestKernel::new();
        let task_id = kernel.dispatch_shell("t1", "e1", &["echo", "hi"]);
        cancel_task(&kernel.events, &task_id, "operator request").expect("cancel");
        assert_eq!(kernel.state(&task_id), TaskState::Canceled);

        let done = completed_with(&kernel, "t2");
        let err = cancel_task(&kernel.events, &done, "too late").expect_err("completed");
        assert_eq!(reason(&err).as_deref(), Some("invalid_state:COMPLETED"));

        let err = cancel_task(&kernel.events, "never-created", "nothing").expect_err("empty");
        assert_eq!(reason(&err).as_deref(), Some("invalid_state:CREATED"));
    }

    fn evaluation_run_spec(kernel: &TestKernel, task_id: &str) -> String {
        let snapshot = rebuild_task_state(&kernel.events, task_id).expect("rebuild");
        snapshot.latest_evaluated().expect("evaluated").run_spec_sha256
    }

    #[test]
    fn refinement_ids_stay_bounded_across_generations() {
        let kernel = TestKernel::new();
        let mut task_id = completed(&kernel);
        for generation in 1..=4 {
            let evaluation = evaluate_task(
                &kernel.events,
                &kernel.evidence,
                &task_id,
                EvalDecision::Refine,
                Some("again"),
            )
            .expect("evaluate");
            let exec_id = format!("e{}", generation + 1);
            let refinement = create_refinement_task(
                &kernel.events,
                &kernel.evidence,
                &kernel.roles,
                &task_id,
                &exec_id,
            )
            .expect("refine");
            let child_id = refinement.refinement_task_id;
            assert_eq!(evaluation.refinement_task_id.as_deref(), Some(child_id.as_str()));
            assert_eq!(child_id.len(), "refine::".len() + 16 + "::".len() + 16);

            let child = rebuild_task_state(&kernel.events, &child_id).expect("child");
            let payload = child.created().expect("created").payload;
            assert_eq!(payload["lineage_parent_task_id"], json!(task_id));

            kernel.route(&child_id);
            let summary = kernel.runner().run_dispatched(&child_id).expect("run child");
            assert!(summary.ok, "generation {generation}: {}", summary.reason);
            task_id = child_id;
        }
        assert_eq!(kernel.state(&task_id), TaskState::Completed);
    }

    fn completed_with(kernel: &TestKernel, task_id: &str) -> String {
        let task_id = kernel.dispatch_shell(task_id, "e1", &["true"]);
        kernel.runner().run_dispatched(&task_id).expect("run");
        task_id
    }
}
