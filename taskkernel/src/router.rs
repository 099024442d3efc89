//! Dispatch gate: replayed state plus policy decide whether a verified task
//! may be dispatched. Nothing executes here.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::events::{EventBody, TaskDispatched, TaskRejected};
use crate::core::policy::RoleRegistry;
use crate::core::types::{Task, TaskState};
use crate::error::{KernelError, kernel_error};
use crate::io::event_store::{EventRef, FsEventStore};
use crate::state::rebuild_task_state;

pub const DISPATCHED: &str = "dispatched";

#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub ok: bool,
    pub reason: String,
    pub task_id: String,
    pub role: String,
    pub action: String,
    /// `TASK_DISPATCHED` or `TASK_REJECTED`, when one was appended.
    #[serde(skip)]
    pub event: Option<EventRef>,
}

impl RouteResult {
    fn new(task: &Task, ok: bool, reason: String, event: Option<EventRef>) -> Self {
        Self {
            ok,
            reason,
            task_id: task.task_id.clone(),
            role: task.role.clone(),
            action: task.action.clone(),
            event,
        }
    }
}

pub struct ExecutionRouter<'a> {
    store: &'a FsEventStore,
    roles: &'a RoleRegistry,
}

impl<'a> ExecutionRouter<'a> {
    pub fn new(store: &'a FsEventStore, roles: &'a RoleRegistry) -> Self {
        Self { store, roles }
    }

    /// Dispatch `task` if it is VERIFIED and its role may perform its action.
    #[instrument(skip_all, fields(task_id = %task.task_id, role = %task.role, action = %task.action))]
    pub fn route(&self, task: &Task) -> Result<RouteResult> {
        let snapshot = match rebuild_task_state(self.store, &task.task_id) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let reason = match kernel_error(&err) {
                    Some(violation @ KernelError::FsmViolation { .. }) => violation.reason(),
                    Some(other) => format!("state_rebuild_error:{}", other.kind().as_str()),
                    None => "state_rebuild_error:io".to_string(),
                };
                warn!(err = %format!("{err:#}"), reason = %reason, "route denied");
                return Ok(RouteResult::new(task, false, reason, None));
            }
        };

        if snapshot.state != TaskState::Verified {
            let reason = format!("invalid_state:{}", snapshot.state);
            warn!(reason = %reason, "route denied");
            return Ok(RouteResult::new(task, false, reason, None));
        }
        if let Some(created) = snapshot.created()
            && (created.role != task.role || created.action != task.action)
        {
            let reason = KernelError::TaskMismatch {
                task_id: task.task_id.clone(),
            }
            .reason();
            warn!(reason = %reason, "route denied");
            return Ok(RouteResult::new(task, false, reason, None));
        }

        let decision = self.roles.decide(&task.role, &task.action);
        if !decision.allow {
            let event = self.store.append_next(
                &task.task_id,
                snapshot.next_seq(),
                &EventBody::TaskRejected(TaskRejected {
                    role: task.role.clone(),
                    action: task.action.clone(),
                    reason: decision.reason.clone(),
                }),
            )?;
            warn!(reason = %decision.reason, "policy denied dispatch");
            return Ok(RouteResult::new(task, false, decision.reason, Some(event)));
        }

        let inputs_manifest_sha256 = snapshot
            .latest_verified()
            .and_then(|verified| verified.inputs_manifest_sha256);
        let event = self.store.append_next(
            &task.task_id,
            snapshot.next_seq(),
            &EventBody::TaskDispatched(TaskDispatched {
                role: task.role.clone(),
                action: task.action.clone(),
                attempt: task.attempt,
                inputs_manifest_sha256,
            }),
        )?;
        info!(seq = event.seq, "task dispatched");
        Ok(RouteResult::new(task, true, DISPATCHED.to_string(), Some(event)))
    }
}
