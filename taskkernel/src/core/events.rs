//! Event records and their typed bodies.
//!
//! On disk an event is a flat JSON record whose `body` is free-form. In memory
//! the body is decoded into [`EventBody`], a closed sum type, so the transition
//! table can match exhaustively and a malformed body is caught at replay time.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::canonical::canonical_sha256;
use crate::core::types::{EvalDecision, EventType};

/// One persisted event, exactly as stored in `<seq>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub task_id: String,
    pub seq: u64,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub body: Value,
    pub prev_hash: Option<String>,
    pub hash: String,
}

/// Fields covered by an event's hash (everything but `hash`).
#[derive(Serialize)]
struct EventCore<'a> {
    task_id: &'a str,
    seq: u64,
    timestamp: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    body: &'a Value,
    prev_hash: Option<&'a str>,
}

impl Event {
    /// Build a sealed event: the hash is computed over the other fields.
    pub fn seal(
        task_id: &str,
        seq: u64,
        timestamp: String,
        body: &EventBody,
        prev_hash: Option<String>,
    ) -> Result<Self> {
        let (event_type, body) = body.encode()?;
        let mut event = Event {
            task_id: task_id.to_string(),
            seq,
            timestamp,
            event_type: event_type.as_str().to_string(),
            body,
            prev_hash,
            hash: String::new(),
        };
        event.hash = event.compute_hash()?;
        Ok(event)
    }

    /// Hash of the canonical core fields.
    pub fn compute_hash(&self) -> Result<String> {
        canonical_sha256(&EventCore {
            task_id: &self.task_id,
            seq: self.seq,
            timestamp: &self.timestamp,
            event_type: &self.event_type,
            body: &self.body,
            prev_hash: self.prev_hash.as_deref(),
        })
    }

    /// Content address used as the third replay sort key.
    pub fn event_id(&self) -> &str {
        &self.hash
    }

    pub fn kind(&self) -> Result<EventType> {
        self.event_type.parse::<EventType>().map_err(|err| anyhow!(err))
    }

    /// Decode the free-form body into its typed variant.
    pub fn decode(&self) -> Result<EventBody> {
        let kind = self.kind()?;
        EventBody::decode(kind, &self.body)
    }
}

/// Typed event payloads, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventBody {
    TaskCreated(TaskCreated),
    TaskVerified(TaskVerified),
    TaskDispatched(TaskDispatched),
    TaskRejected(TaskRejected),
    TaskCanceled(TaskCanceled),
    RunStarted(RunStarted),
    RunSucceeded(RunSucceeded),
    RunFailed(RunFailed),
    TaskEvaluated(TaskEvaluated),
}

impl EventBody {
    pub fn event_type(&self) -> EventType {
        match self {
            EventBody::TaskCreated(_) => EventType::TaskCreated,
            EventBody::TaskVerified(_) => EventType::TaskVerified,
            EventBody::TaskDispatched(_) => EventType::TaskDispatched,
            EventBody::TaskRejected(_) => EventType::TaskRejected,
            EventBody::TaskCanceled(_) => EventType::TaskCanceled,
            EventBody::RunStarted(_) => EventType::RunStarted,
            EventBody::RunSucceeded(_) => EventType::RunSucceeded,
            EventBody::RunFailed(_) => EventType::RunFailed,
            EventBody::TaskEvaluated(_) => EventType::TaskEvaluated,
        }
    }

    /// Split into the on-disk `(type, body)` pair.
    pub fn encode(&self) -> Result<(EventType, Value)> {
        let tagged = serde_json::to_value(self).context("serialize event body")?;
        let body = tagged
            .get("body")
            .cloned()
            .ok_or_else(|| anyhow!("event body missing after serialization"))?;
        Ok((self.event_type(), body))
    }

    pub fn decode(kind: EventType, body: &Value) -> Result<Self> {
        serde_json::from_value(json!({ "type": kind.as_str(), "body": body }))
            .with_context(|| format!("malformed {kind} body"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub role: String,
    pub action: String,
    pub payload: Value,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskVerified {
    pub role: String,
    pub action: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub inputs_manifest_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatched {
    pub role: String,
    pub action: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub inputs_manifest_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRejected {
    pub role: String,
    pub action: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCanceled {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStarted {
    pub exec_id: String,
    pub spec_sha256: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSucceeded {
    pub exec_id: String,
    pub spec_sha256: String,
    pub exit_code: i32,
    pub stdout_sha256: String,
    pub stderr_sha256: String,
    pub outputs_manifest_sha256: String,
    pub manifest_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailed {
    pub exec_id: String,
    pub spec_sha256: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub error_class: String,
    pub error_sha256: String,
    #[serde(default)]
    pub manifest_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvaluated {
    pub decision: EvalDecision,
    #[serde(default)]
    pub note: Option<String>,
    pub exec_id: String,
    pub run_spec_sha256: String,
    pub run_manifest_sha256: String,
    pub evaluation_spec_sha256: String,
    pub evaluation_manifest_sha256: String,
    #[serde(default)]
    pub refinement_task_id: Option<String>,
}
