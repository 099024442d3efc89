//! State reconstruction. The only sanctioned way to learn a task's state.

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::events::{Event, EventBody, RunSucceeded, TaskCreated, TaskEvaluated, TaskVerified};
use crate::core::fsm::replay;
use crate::core::types::TaskState;
use crate::error::KernelError;
use crate::io::event_store::EventSource;

/// Replayed view of one task.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub state: TaskState,
    /// Events in replay order. Every one passed the transition table.
    pub history: Vec<Event>,
}

impl TaskSnapshot {
    fn bodies(&self) -> impl DoubleEndedIterator<Item = EventBody> + '_ {
        // Replay already decoded each body once, so this cannot fail here.
        self.history.iter().filter_map(|event| event.decode().ok())
    }

    pub fn created(&self) -> Option<TaskCreated> {
        self.bodies().find_map(|body| match body {
            EventBody::TaskCreated(created) => Some(created),
            _ => None,
        })
    }

    pub fn latest_verified(&self) -> Option<TaskVerified> {
        self.bodies().rev().find_map(|body| match body {
            EventBody::TaskVerified(verified) => Some(verified),
            _ => None,
        })
    }

    pub fn latest_run_succeeded(&self) -> Option<RunSucceeded> {
        self.bodies().rev().find_map(|body| match body {
            EventBody::RunSucceeded(run) => Some(run),
            _ => None,
        })
    }

    pub fn latest_evaluated(&self) -> Option<TaskEvaluated> {
        self.bodies().rev().find_map(|body| match body {
            EventBody::TaskEvaluated(evaluated) => Some(evaluated),
            _ => None,
        })
    }

    /// Sequence number the next event must take for this snapshot to still
    /// be current. Pass it to [`FsEventStore::append_next`].
    ///
    /// [`FsEventStore::append_next`]: crate::io::event_store::FsEventStore::append_next
    pub fn next_seq(&self) -> u64 {
        self.history.iter().map(|e| e.seq + 1).max().unwrap_or(0)
    }

    /// Fail with `InvalidState` unless the task is in `expected`.
    pub fn require(&self, expected: TaskState) -> Result<(), KernelError> {
        if self.state == expected {
            return Ok(());
        }
        Err(KernelError::InvalidState {
            task_id: self.task_id.clone(),
            state: self.state,
        })
    }
}

/// Load, sort and replay every event of `task_id` through a fresh FSM.
#[instrument(skip(source))]
pub fn rebuild_task_state(source: &impl EventSource, task_id: &str) -> Result<TaskSnapshot> {
    let events = source.list_events(task_id)?;
    let fsm = match replay(task_id, events) {
        Ok(fsm) => fsm,
        Err(violation) => {
            warn!(
                reason = %violation.reason,
                evidence_sha256 = %violation.evidence_sha256,
                "fsm violation during replay"
            );
            return Err(KernelError::from(violation).into());
        }
    };
    debug!(state = %fsm.state(), events = fsm.history().len(), "rebuilt task state");
    Ok(TaskSnapshot {
        task_id: task_id.to_string(),
        state: fsm.state(),
        history: fsm.into_history(),
    })
}
