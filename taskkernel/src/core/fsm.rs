//! Replay-derived task state machine.
//!
//! State is a fold of the event log through a fixed transition table. Anything
//! the table does not list is a violation, and a violation carries a hash of a
//! deterministic evidence object so it can be located and audited later.

use serde_json::{Value, json};

use crate::core::canonical::{canonical_value, sha256_hex};
use crate::core::events::Event;
use crate::core::types::{EventType, TaskState};
use crate::error::KernelError;

/// Next state for `(state, event)`, or `None` when the pair is illegal.
pub fn transition(state: TaskState, event: EventType) -> Option<TaskState> {
    use EventType as E;
    use TaskState as S;

    match (state, event) {
        (S::Created, E::TaskCreated) => Some(S::Created),
        (S::Created, E::TaskVerified) => Some(S::Verified),
        (S::Verified, E::TaskVerified) => Some(S::Verified),
        (S::Verified, E::TaskDispatched) => Some(S::Dispatched),
        (S::Verified, E::TaskRejected) => Some(S::Rejected),
        (S::Created | S::Verified | S::Dispatched, E::TaskCanceled) => Some(S::Canceled),
        (S::Dispatched, E::RunStarted) => Some(S::Running),
        (S::Running, E::RunSucceeded) => Some(S::Completed),
        (S::Running, E::RunFailed) => Some(S::Failed),
        (S::Completed, E::TaskEvaluated) => Some(S::Evaluated),
        (
            S::Created
            | S::Verified
            | S::Dispatched
            | S::Running
            | S::Completed
            | S::Failed
            | S::Evaluated
            | S::Rejected
            | S::Canceled,
            E::TaskCreated
            | E::TaskVerified
            | E::TaskDispatched
            | E::TaskRejected
            | E::TaskCanceled
            | E::RunStarted
            | E::RunSucceeded
            | E::RunFailed
            | E::TaskEvaluated,
        ) => None,
    }
}

/// A rejected event together with its audit evidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub task_id: String,
    pub prev_state: TaskState,
    pub event_type: String,
    pub reason: String,
    pub evidence: Value,
    pub evidence_sha256: String,
}

impl Violation {
    fn new(task_id: &str, prev_state: TaskState, event: &Event, reason: String) -> Self {
        let event_value = serde_json::to_value(event).unwrap_or(Value::Null);
        let evidence = json!({
            "task_id": task_id,
            "prev_state": prev_state.as_str(),
            "event_type": event.event_type,
            "reason": reason,
            "event": event_value,
        });
        let evidence_sha256 = sha256_hex(canonical_value(&evidence).to_string());
        Self {
            task_id: task_id.to_string(),
            prev_state,
            event_type: event.event_type.clone(),
            reason,
            evidence,
            evidence_sha256,
        }
    }
}

impl From<Violation> for KernelError {
    fn from(violation: Violation) -> Self {
        KernelError::FsmViolation {
            task_id: violation.task_id,
            reason: violation.reason,
            evidence_sha256: violation.evidence_sha256,
        }
    }
}

/// In-memory replay of one task's events.
#[derive(Debug, Clone)]
pub struct TaskFsm {
    task_id: String,
    state: TaskState,
    history: Vec<Event>,
}

impl TaskFsm {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: TaskState::Created,
            history: Vec::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn history(&self) -> &[Event] {
        &self.history
    }

    pub fn into_history(self) -> Vec<Event> {
        self.history
    }

    /// Apply one event. On violation the FSM is left unchanged.
    pub fn apply(&mut self, event: &Event) -> Result<TaskState, Violation> {
        let prev = self.state;
        let fail = |reason: String| Violation::new(&self.task_id, prev, event, reason);

        if event.task_id != self.task_id {
            return Err(fail(format!(
                "task_id mismatch: expected {} got {}",
                self.task_id, event.task_id
            )));
        }
        let kind = match event.kind() {
            Ok(kind) => kind,
            Err(_) => return Err(fail(format!("unknown event type: {}", event.event_type))),
        };
        if prev.is_terminal() {
            return Err(fail(format!("terminal state {prev} rejects {kind}")));
        }
        let Some(next) = transition(prev, kind) else {
            return Err(fail(format!("illegal transition: {prev} --{kind}--> ?")));
        };
        match (kind, self.history.is_empty()) {
            (EventType::TaskCreated, false) => {
                return Err(fail("duplicate TASK_CREATED".to_string()));
            }
            (EventType::TaskCreated, true) | (_, false) => {}
            (_, true) => return Err(fail(format!("{kind} before TASK_CREATED"))),
        }
        if let Err(err) = event.decode() {
            return Err(fail(format!("malformed body: {err:#}")));
        }

        self.history.push(event.clone());
        self.state = next;
        Ok(next)
    }
}

/// Sort events into replay order: `(timestamp, seq, event_id, original index)`.
pub fn sort_for_replay(events: Vec<Event>) -> Vec<Event> {
    let mut indexed: Vec<(usize, Event)> = events.into_iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.seq.cmp(&b.seq))
            .then_with(|| a.event_id().cmp(b.event_id()))
            .then(ia.cmp(ib))
    });
    indexed.into_iter().map(|(_, event)| event).collect()
}

/// Replay `events` in deterministic order through a fresh FSM.
pub fn replay(task_id: &str, events: Vec<Event>) -> Result<TaskFsm, Violation> {
    let mut fsm = TaskFsm::new(task_id);
    for event in &sort_for_replay(events) {
        fsm.apply(event)?;
    }
    Ok(fsm)
}
