//! Append-only, hash-chained event log on the filesystem.
//!
//! Layout per task: `<events_dir>/<task_id>/<seq:020>.json` plus a `HEAD` file
//! holding the last sequence number. Event files are published with
//! [`publish_exclusive`], so two appenders that computed the same `seq` cannot
//! both succeed; the loser sees [`KernelError::EventExists`]. `HEAD` is
//! advisory and never trusted over the files themselves.
//!
//! Callers that decided on a replayed snapshot append with
//! [`FsEventStore::append_next`], naming the sequence number the snapshot
//! ends before. Together with the exclusive publish this is a compare-and-swap
//! on the tip: if anything was appended since the replay, the append fails
//! instead of recording a decision made on stale state.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::canonical::canonical_json;
use crate::core::events::{Event, EventBody};
use crate::core::ids::validate_task_id;
use crate::core::types::EventType;
use crate::error::{KernelError, kernel_error};
use crate::io::atomic::{publish_exclusive, write_atomic};

const HEAD_FILE: &str = "HEAD";

/// Read access to a task's events. Replay only ever needs this.
pub trait EventSource {
    /// All events for `task_id` in storage order. Empty if the task is unknown.
    fn list_events(&self, task_id: &str) -> Result<Vec<Event>>;
}

/// Location of a freshly appended event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRef {
    pub task_id: String,
    pub seq: u64,
    pub event_type: EventType,
    pub hash: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FsEventStore {
    events_dir: PathBuf,
}

impl FsEventStore {
    pub fn new(events_dir: impl Into<PathBuf>) -> Self {
        Self {
            events_dir: events_dir.into(),
        }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.events_dir.join(task_id)
    }

    pub fn event_path(&self, task_id: &str, seq: u64) -> PathBuf {
        self.task_dir(task_id).join(format!("{seq:020}.json"))
    }

    /// Append `body` as the next event of `task_id`, wherever the tip is.
    pub fn append_event(&self, task_id: &str, body: &EventBody) -> Result<EventRef> {
        self.append(task_id, None, body)
    }

    /// Append `body` only if it lands at `expected_seq`. A tip that moved past
    /// `expected_seq` is [`KernelError::EventExists`].
    pub fn append_next(&self, task_id: &str, expected_seq: u64, body: &EventBody) -> Result<EventRef> {
        self.append(task_id, Some(expected_seq), body)
    }

    #[instrument(
        skip_all,
        fields(task_id = %task_id, event_type = %body.event_type(), expected_seq = ?expected_seq)
    )]
    fn append(&self, task_id: &str, expected_seq: Option<u64>, body: &EventBody) -> Result<EventRef> {
        validate_task_id(task_id)?;
        let last = self.last_event(task_id)?;
        let seq = last.as_ref().map_or(0, |e| e.seq + 1);
        if let Some(expected) = expected_seq
            && expected != seq
        {
            warn!(expected, seq, "tip moved since replay");
            return Err(KernelError::EventExists {
                task_id: task_id.to_string(),
                seq: expected,
            }
            .into());
        }
        let prev_hash = last.as_ref().map(|e| e.hash.clone());

        let mut timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        if let Some(prev) = &last
            && prev.timestamp > timestamp
        {
            // Wall clock went backwards; keep (timestamp, seq) consistent with the chain.
            timestamp.clone_from(&prev.timestamp);
        }

        let event = Event::seal(task_id, seq, timestamp, body, prev_hash)?;
        let path = self.event_path(task_id, seq);
        let bytes = canonical_json(&event)?;
        if !publish_exclusive(&path, bytes.as_bytes())? {
            warn!(seq, "event file already exists");
            return Err(KernelError::EventExists {
                task_id: task_id.to_string(),
                seq,
            }
            .into());
        }
        write_atomic(
            &self.task_dir(task_id).join(HEAD_FILE),
            seq.to_string().as_bytes(),
        )?;

        info!(seq, hash = %event.hash, "appended event");
        Ok(EventRef {
            task_id: task_id.to_string(),
            seq,
            event_type: body.event_type(),
            hash: event.hash,
            path,
        })
    }

    /// Sequence number recorded in `HEAD`, if any.
    pub fn head(&self, task_id: &str) -> Result<Option<u64>> {
        let path = self.task_dir(task_id).join(HEAD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let seq = raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(seq))
    }

    /// Recompute every hash and check linkage. Any mismatch yields `false`.
    pub fn verify_chain(&self, task_id: &str) -> Result<bool> {
        match self.check_chain(task_id) {
            Ok(()) => Ok(true),
            Err(err) => match kernel_error(&err) {
                Some(KernelError::ChainMismatch { seq, detail, .. }) => {
                    warn!(task_id, seq, detail = %detail, "chain verification failed");
                    Ok(false)
                }
                _ => Err(err),
            },
        }
    }

    /// Like [`verify_chain`](Self::verify_chain) but reports where it broke.
    #[instrument(skip(self))]
    pub fn check_chain(&self, task_id: &str) -> Result<()> {
        let files = self.event_files(task_id)?;
        let mismatch = |seq: u64, detail: String| -> anyhow::Error {
            KernelError::ChainMismatch {
                task_id: task_id.to_string(),
                seq,
                detail,
            }
            .into()
        };

        let mut prev_hash: Option<String> = None;
        for (index, (seq, path)) in files.iter().enumerate() {
            if *seq != index as u64 {
                return Err(mismatch(index as u64, format!("missing event {index}")));
            }
            let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
            let event: Event = serde_json::from_slice(&raw)
                .map_err(|err| mismatch(*seq, format!("unparseable event: {err}")))?;
            if event.seq != *seq || event.task_id != task_id {
                return Err(mismatch(*seq, "event identity does not match its file".into()));
            }
            if event.compute_hash()? != event.hash {
                return Err(mismatch(*seq, "hash mismatch".into()));
            }
            if event.prev_hash != prev_hash {
                return Err(mismatch(*seq, "prev_hash does not link".into()));
            }
            prev_hash = Some(event.hash);
        }

        if let Some(head) = self.head(task_id)?
            && head >= files.len() as u64
        {
            return Err(mismatch(head, "HEAD points past the last event".into()));
        }
        debug!(events = files.len(), "chain verified");
        Ok(())
    }

    /// Event files sorted by sequence number.
    fn event_files(&self, task_id: &str) -> Result<Vec<(u64, PathBuf)>> {
        let dir = self.task_dir(task_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if let Some(seq) = parse_event_file_name(&entry.path()) {
                files.push((seq, entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_event(&self, path: &Path) -> Result<Event> {
        let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
    }

    /// The newest event, using `HEAD` only when it is ahead of the files.
    fn last_event(&self, task_id: &str) -> Result<Option<Event>> {
        let files = self.event_files(task_id)?;
        let from_files = files.last().map(|(seq, _)| *seq);
        let tip = match (self.head(task_id)?, from_files) {
            (Some(head), Some(seq)) => Some(head.max(seq)),
            (head, seq) => head.or(seq),
        };
        match tip {
            Some(seq) => self.read_event(&self.event_path(task_id, seq)).map(Some),
            None => Ok(None),
        }
    }
}

impl EventSource for FsEventStore {
    fn list_events(&self, task_id: &str) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for (seq, path) in self.event_files(task_id)? {
            let event = self.read_event(&path)?;
            if event.compute_hash()? != event.hash {
                return Err(KernelError::ChainMismatch {
                    task_id: task_id.to_string(),
                    seq,
                    detail: "hash mismatch".to_string(),
                }
                .into());
            }
            events.push(event);
        }
        Ok(events)
    }
}

fn parse_event_file_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".json")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
