//! Canonical execution contract.
//!
//! An [`ExecutionSpec`] is built from the `TASK_CREATED` payload and is the
//! execution identity: two specs with equal canonical JSON have equal
//! `spec_sha256`, and that hash keys the attempt ledger.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::canonical::{canonical_json, canonical_sha256, sha256_hex};
use crate::core::events::TaskCreated;
use crate::core::ids::validate_exec_id;
use crate::error::KernelError;

const PAYLOAD_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/exec_payload.v1.schema.json"
));

/// Supported execution kinds. Anything else is refused before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecKind {
    Shell,
}

impl ExecKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ExecKind::Shell => "shell",
        }
    }
}

impl fmt::Display for ExecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecKind {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "shell" => Ok(ExecKind::Shell),
            other => Err(KernelError::UnsupportedKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// Upstream payload contract, after schema validation.
#[derive(Debug, Clone, Deserialize)]
struct ExecPayload {
    exec_id: String,
    kind: String,
    cmd_argv: Vec<String>,
    cwd: String,
    env_allowlist: Vec<String>,
    timeout_s: u64,
    inputs_manifest_sha256: String,
    paths_allowlist: Vec<String>,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub exec_id: String,
    pub task_id: String,
    pub role: String,
    pub action: String,
    pub kind: ExecKind,
    pub cmd_argv: Vec<String>,
    pub cwd: String,
    pub env_allowlist: Vec<String>,
    pub timeout_s: u64,
    pub inputs_manifest_sha256: String,
    pub paths_allowlist: Vec<String>,
    /// Human-readable intent. Serialized as `null` when absent.
    pub note: Option<String>,
}

impl ExecutionSpec {
    pub fn canonical_json(&self) -> Result<String> {
        canonical_json(self)
    }

    pub fn spec_sha256(&self) -> Result<String> {
        canonical_sha256(self)
    }
}

/// Limits applied while building a spec.
#[derive(Debug, Clone, Copy)]
pub struct SpecLimits {
    pub max_timeout_s: u64,
}

/// Build the spec for `task_id` from its creation record.
///
/// `verified_manifest` is the inputs manifest hash recorded at verification
/// time; when present the payload must agree with it.
pub fn build_execution_spec(
    task_id: &str,
    created: &TaskCreated,
    verified_manifest: Option<&str>,
    limits: SpecLimits,
) -> Result<ExecutionSpec, KernelError> {
    validate_payload(&created.payload)?;
    let payload: ExecPayload =
        serde_json::from_value(created.payload.clone()).map_err(|err| {
            KernelError::InvalidPayload {
                detail: err.to_string(),
            }
        })?;

    let kind = payload.kind.parse::<ExecKind>()?;
    validate_exec_id(&payload.exec_id)?;
    if payload.timeout_s > limits.max_timeout_s {
        return Err(KernelError::InvalidPayload {
            detail: format!(
                "timeout_s {} exceeds max {}",
                payload.timeout_s, limits.max_timeout_s
            ),
        });
    }
    if let Some(verified) = verified_manifest
        && verified != payload.inputs_manifest_sha256
    {
        return Err(KernelError::InvalidPayload {
            detail: "inputs_manifest_mismatch".to_string(),
        });
    }

    Ok(ExecutionSpec {
        exec_id: payload.exec_id,
        task_id: task_id.to_string(),
        role: created.role.clone(),
        action: created.action.clone(),
        kind,
        cmd_argv: payload.cmd_argv,
        cwd: payload.cwd,
        env_allowlist: payload.env_allowlist,
        timeout_s: payload.timeout_s,
        inputs_manifest_sha256: payload.inputs_manifest_sha256,
        paths_allowlist: payload.paths_allowlist,
        note: payload.note,
    })
}

fn validate_payload(payload: &Value) -> Result<(), KernelError> {
    let invalid = |detail: String| KernelError::InvalidPayload { detail };
    let schema: Value = serde_json::from_str(PAYLOAD_SCHEMA)
        .map_err(|err| invalid(format!("payload schema unreadable: {err}")))?;
    let compiled = jsonschema::validator_for(&schema)
        .map_err(|err| invalid(format!("payload schema invalid: {err}")))?;
    if compiled.is_valid(payload) {
        return Ok(());
    }
    let mut errors: Vec<String> = compiled.iter_errors(payload).map(|e| e.to_string()).collect();
    errors.sort();
    Err(invalid(errors.join("; ")))
}

/// sha256 of the canonical `{"files": {path: sha256}}` inputs manifest.
pub fn canonical_inputs_manifest(files: &BTreeMap<String, String>) -> String {
    let manifest = json!({ "files": files });
    sha256_hex(crate::core::canonical::canonical_value(&manifest).to_string())
}
