//! Task and plan verification.
//!
//! Verification is the gate in front of the router: it records the task's
//! creation once, checks the declared intent against policy and marks the
//! task VERIFIED. Nothing executes here.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::core::canonical::{canonical_sha256, is_sha256_hex};
use crate::core::events::{EventBody, TaskCreated, TaskVerified};
use crate::core::ids::validate_task_id;
use crate::core::policy::RoleRegistry;
use crate::core::types::{Task, TaskState};
use crate::error::{KernelError, kernel_error};
use crate::io::event_store::{EventRef, FsEventStore};
use crate::io::evidence::{BundleRef, EvidenceStore, RejectionRecord};
use crate::state::rebuild_task_state;

#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub ok: bool,
    pub reason: String,
    pub task_id: String,
    /// `TASK_CREATED` appended by this call (only on first verification).
    pub created: Option<EventRef>,
    /// `TASK_VERIFIED` appended by this call.
    pub verified: Option<EventRef>,
    /// Rejection bundle written when verification refused the task.
    pub rejection: Option<BundleRef>,
}

impl VerifyResult {
    fn refused(task: &Task, reason: String, rejection: BundleRef) -> Self {
        Self {
            ok: false,
            reason,
            task_id: task.task_id.clone(),
            created: None,
            verified: None,
            rejection: Some(rejection),
        }
    }
}

/// Verify `task`: record `TASK_CREATED` on first sight, then `TASK_VERIFIED`.
///
/// Refusals (bad payload, policy denial, wrong state, a resubmission that
/// disagrees with the recorded creation) leave a rejection bundle and append
/// nothing.
#[instrument(skip_all, fields(task_id = %task.task_id, role = %task.role, action = %task.action))]
pub fn verify_task(
    store: &FsEventStore,
    evidence: &EvidenceStore,
    roles: &RoleRegistry,
    task: &Task,
) -> Result<VerifyResult> {
    validate_task_id(&task.task_id)?;

    if let Err(refusal) = check_payload(&task.payload) {
        return refuse(evidence, task, &refusal);
    }
    if let Some(denial) = roles.decide(&task.role, &task.action).into_denial() {
        return refuse(evidence, task, &denial);
    }

    let snapshot = match rebuild_task_state(store, &task.task_id) {
        Ok(snapshot) => snapshot,
        Err(err) => match kernel_error(&err) {
            Some(refusal) => return refuse(evidence, task, refusal),
            None => return Err(err),
        },
    };
    if !matches!(snapshot.state, TaskState::Created | TaskState::Verified) {
        let refusal = KernelError::InvalidState {
            task_id: task.task_id.clone(),
            state: snapshot.state,
        };
        return refuse(evidence, task, &refusal);
    }

    let created = match snapshot.created() {
        Some(recorded) if !same_intent(&recorded, task) => {
            let refusal = KernelError::TaskMismatch {
                task_id: task.task_id.clone(),
            };
            return refuse(evidence, task, &refusal);
        }
        Some(_) => None,
        None => Some(store.append_next(
            &task.task_id,
            snapshot.next_seq(),
            &EventBody::TaskCreated(TaskCreated {
                role: task.role.clone(),
                action: task.action.clone(),
                payload: task.payload.clone(),
                attempt: task.attempt,
            }),
        )?),
    };

    let next_seq = created.as_ref().map_or(snapshot.next_seq(), |event| event.seq + 1);
    let verified = store.append_next(
        &task.task_id,
        next_seq,
        &EventBody::TaskVerified(TaskVerified {
            role: task.role.clone(),
            action: task.action.clone(),
            attempt: task.attempt,
            inputs_manifest_sha256: task
                .payload
                .get("inputs_manifest_sha256")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
    )?;
    info!(seq = verified.seq, "task verified");

    Ok(VerifyResult {
        ok: true,
        reason: "verified".to_string(),
        task_id: task.task_id.clone(),
        created,
        verified: Some(verified),
        rejection: None,
    })
}

fn same_intent(recorded: &TaskCreated, task: &Task) -> bool {
    recorded.role == task.role
        && recorded.action == task.action
        && recorded.payload == task.payload
        && recorded.attempt == task.attempt
}

fn check_payload(payload: &Value) -> Result<(), KernelError> {
    let invalid = |detail: &str| KernelError::InvalidPayload {
        detail: detail.to_string(),
    };
    let Some(fields) = payload.as_object() else {
        return Err(invalid("payload must be an object"));
    };
    match fields.get("inputs_manifest_sha256") {
        None => Ok(()),
        Some(Value::String(sha)) if is_sha256_hex(sha) => Ok(()),
        Some(_) => Err(invalid("inputs_manifest_sha256 must be a sha256 hex digest")),
    }
}

fn refuse(evidence: &EvidenceStore, task: &Task, refusal: &KernelError) -> Result<VerifyResult> {
    let reason = refusal.reason();
    warn!(reason = %reason, "verification refused");
    let bundle = evidence.record_rejection(&RejectionRecord {
        task_id: task.task_id.clone(),
        reason: reason.clone(),
        context: json!({
            "stage": "verify",
            "role": task.role,
            "action": task.action,
            "attempt": task.attempt,
        }),
        ..RejectionRecord::default()
    })?;
    Ok(VerifyResult::refused(task, reason, bundle))
}

/// One `(role, action)` step of a proposed plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub role: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDecision {
    pub i: usize,
    pub role: String,
    pub action: String,
    pub allow: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PlanVerification {
    pub ok: bool,
    pub decisions: Vec<StepDecision>,
    pub plan_sha256: String,
    pub bundle: BundleRef,
}

/// Decide every step of a plan and record the decisions as a verification
/// bundle keyed by the plan's canonical hash. Nothing is executed.
#[instrument(skip_all, fields(steps = steps.len()))]
pub fn verify_plan(
    evidence: &EvidenceStore,
    roles: &RoleRegistry,
    steps: &[PlanStep],
) -> Result<PlanVerification> {
    let decisions: Vec<StepDecision> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let decision = roles.decide(&step.role, &step.action);
            StepDecision {
                i,
                role: step.role.clone(),
                action: step.action.clone(),
                allow: decision.allow,
                reason: decision.reason,
            }
        })
        .collect();
    let ok = decisions.iter().all(|d| d.allow);

    let plan_sha256 = canonical_sha256(&json!({ "steps": steps }))?;
    let record = json!({ "ok": ok, "decisions": decisions });
    let bundle = evidence.write_verification_bundle(&plan_sha256, &record, "plan_verification")?;
    info!(ok, "plan verified");
    Ok(PlanVerification {
        ok,
        decisions,
        plan_sha256,
        bundle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::event_store::EventSource;
    use crate::test_support::{TestKernel, task};

    #[test]
    fn first_verification_emits_created_and_verified() {
        let kernel = TestKernel::new();
        let t = task("t_verify_1", "morpheus", "architecture", json!({}));
        let res = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("verify");
        assert!(res.ok);
        assert!(res.created.is_some());
        assert!(res.verified.is_some());

        let types: Vec<String> = kernel
            .events
            .list_events("t_verify_1")
            .expect("list")
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, ["TASK_CREATED", "TASK_VERIFIED"]);
    }

    #[test]
    fn reverification_appends_only_verified() {
        let kernel = TestKernel::new();
        let t = task("t_verify_2", "morpheus", "architecture", json!({}));
        let first = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("1");
        let second = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("2");
        assert!(first.ok && second.ok);
        assert!(second.created.is_none());

        let types: Vec<String> = kernel
            .events
            .list_events("t_verify_2")
            .expect("list")
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, ["TASK_CREATED", "TASK_VERIFIED", "TASK_VERIFIED"]);
    }

    #[test]
    fn changed_resubmission_is_refused_without_events() {
        let kernel = TestKernel::new();
        let t = task("t1", "morpheus", "architecture", json!({"v": 1}));
        verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("verify");

        let changed = task("t1", "morpheus", "architecture", json!({"v": 2}));
        let res =
            verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &changed).expect("verify");
        assert!(!res.ok);
        assert_eq!(res.reason, "task_mismatch:t1");
        assert!(res.rejection.expect("bundle").dir.is_dir());
        assert_eq!(kernel.events.list_events("t1").expect("list").len(), 2);
    }

    #[test]
    fn policy_denial_is_refused_before_creation() {
        let kernel = TestKernel::new();
        let t = task("t1", "morpheus", "code_execution", json!({}));
        let res = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("verify");
        assert!(!res.ok);
        assert_eq!(res.reason, "deny:prohibited:morpheus:code_execution");
        assert!(kernel.events.list_events("t1").expect("list").is_empty());
    }

    #[test]
    fn malformed_manifest_hash_is_refused() {
        let kernel = TestKernel::new();
        let t = task(
            "t1",
            "recon",
            "evidence_capture",
            json!({"inputs_manifest_sha256": "nope"}),
        );
        let res = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &t).expect("verify");
        assert!(!res.ok);
        assert!(res.reason.starts_with("invalid_payload:"));
    }

    #[test]
    fn plan_decisions_are_recorded_once() {
        let kernel = TestKernel::new();
        let steps = vec![
            PlanStep {
                role: "scout".to_string(),
                action: "external_research".to_string(),
            },
            PlanStep {
                role: "scout".to_string(),
                action: "local_execution".to_string(),
            },
        ];
        let first = verify_plan(&kernel.evidence, &kernel.roles, &steps).expect("plan");
        assert!(!first.ok);
        assert!(first.decisions[0].allow);
        assert_eq!(first.decisions[1].reason, "deny:prohibited:scout:local_execution");

        let again = verify_plan(&kernel.evidence, &kernel.roles, &steps).expect("plan again");
        assert_eq!(first.bundle.manifest_sha256, again.bundle.manifest_sha256);
        assert_eq!(first.plan_sha256, again.plan_sha256);
    }
}
