//! Core data types shared across kernel modules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replay-derived lifecycle state of a task.
///
/// Never persisted: the only way to obtain it is replaying the task's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Verified,
    Dispatched,
    Running,
    Completed,
    Failed,
    /// Completed run whose result has been accepted or sent back for refinement.
    Evaluated,
    /// Router denied the dispatch.
    Rejected,
    Canceled,
}

impl TaskState {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Verified => "VERIFIED",
            TaskState::Dispatched => "DISPATCHED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Evaluated => "EVALUATED",
            TaskState::Rejected => "REJECTED",
            TaskState::Canceled => "CANCELED",
        }
    }

    /// Terminal states accept no further events.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::Evaluated | TaskState::Rejected | TaskState::Canceled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of event types the transition table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskCreated,
    TaskVerified,
    TaskDispatched,
    TaskRejected,
    TaskCanceled,
    RunStarted,
    RunSucceeded,
    RunFailed,
    TaskEvaluated,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::TaskCreated,
        EventType::TaskVerified,
        EventType::TaskDispatched,
        EventType::TaskRejected,
        EventType::TaskCanceled,
        EventType::RunStarted,
        EventType::RunSucceeded,
        EventType::RunFailed,
        EventType::TaskEvaluated,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::TaskCreated => "TASK_CREATED",
            EventType::TaskVerified => "TASK_VERIFIED",
            EventType::TaskDispatched => "TASK_DISPATCHED",
            EventType::TaskRejected => "TASK_REJECTED",
            EventType::TaskCanceled => "TASK_CANCELED",
            EventType::RunStarted => "RUN_STARTED",
            EventType::RunSucceeded => "RUN_SUCCEEDED",
            EventType::RunFailed => "RUN_FAILED",
            EventType::TaskEvaluated => "TASK_EVALUATED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == value)
            .ok_or_else(|| format!("unknown event type {value:?}"))
    }
}

/// Declared intent: who wants to do what, with which payload.
///
/// Recorded once in `TASK_CREATED` and only referenced afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub role: String,
    pub action: String,
    pub payload: Value,
    #[serde(default)]
    pub attempt: u32,
}

/// Terminal outcome recorded in evidence bundles and the attempt ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    Rejected,
}

impl ExecutionOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionOutcome::Succeeded => "SUCCEEDED",
            ExecutionOutcome::Failed => "FAILED",
            ExecutionOutcome::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluation verdict on a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalDecision {
    Accept,
    Refine,
}

impl EvalDecision {
    pub const fn as_str(self) -> &'static str {
        match self {
            EvalDecision::Accept => "accept",
            EvalDecision::Refine => "refine",
        }
    }
}

impl FromStr for EvalDecision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "accept" => Ok(EvalDecision::Accept),
            "refine" => Ok(EvalDecision::Refine),
            other => Err(format!("unknown evaluation decision {other:?}")),
        }
    }
}
