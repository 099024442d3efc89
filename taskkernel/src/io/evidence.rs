//! Content-addressed, write-once evidence bundles.
//!
//! Every bundle is a directory holding payload files, a
//! `manifest.sha256.json` (`{"files": {path: sha256}}`, canonical) and a
//! `run_summary.json` that records the manifest's own hash. Bundles are
//! staged in a sibling directory and moved into place in one rename.
//!
//! Execution bundles are strictly write-once. Verification and rejection
//! bundles accept a second write only when it is byte-identical.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::canonical::{canonical_json, canonical_value, is_sha256_hex, sha256_hex};
use crate::core::ids::{validate_exec_id, validate_task_id};
use crate::core::spec::{ExecutionSpec, canonical_inputs_manifest};
use crate::core::types::ExecutionOutcome;
use crate::error::{KernelError, kernel_error};
use crate::io::atomic::{publish_dir, staging_path};

pub const SCHEMA_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.sha256.json";
pub const SUMMARY_FILE: &str = "run_summary.json";
pub const EXEC_SPEC_FILE: &str = "exec_spec.json";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const OUTPUTS_DIR: &str = "outputs";
pub const REJECTION_FILE: &str = "rejection.json";
pub const DECISION_FILE: &str = "decision.json";

/// `run_summary.json` of an execution bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub schema_version: u32,
    pub task_id: String,
    pub exec_id: String,
    pub outcome: ExecutionOutcome,
    pub reason: String,
    pub idempotency_key: Option<String>,
    pub spec_sha256: String,
    pub manifest_sha256: String,
}

/// What an execution produced, ready to be sealed into a bundle.
#[derive(Debug, Clone)]
pub struct ExecutionRecord<'a> {
    pub spec: &'a ExecutionSpec,
    pub stdout: &'a [u8],
    pub stderr: &'a [u8],
    /// Declared outputs keyed by path relative to `outputs/`.
    pub outputs: &'a BTreeMap<String, Vec<u8>>,
    pub outcome: ExecutionOutcome,
    pub reason: &'a str,
    pub idempotency_key: Option<&'a str>,
}

/// A published bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRef {
    pub dir: PathBuf,
    pub manifest_sha256: String,
    pub files: BTreeMap<String, String>,
}

impl BundleRef {
    pub fn file_sha256(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    /// Hash of the `outputs/` sub-manifest, paths relative to `outputs/`.
    pub fn outputs_manifest_sha256(&self) -> String {
        let prefix = format!("{OUTPUTS_DIR}/");
        let outputs: BTreeMap<String, String> = self
            .files
            .iter()
            .filter_map(|(path, sha)| {
                path.strip_prefix(&prefix)
                    .map(|rel| (rel.to_string(), sha.clone()))
            })
            .collect();
        canonical_inputs_manifest(&outputs)
    }
}

/// A refusal worth recording.
#[derive(Debug, Clone, Default)]
pub struct RejectionRecord {
    pub task_id: String,
    pub reason: String,
    pub exec_id: Option<String>,
    pub spec_sha256: Option<String>,
    pub idempotency_key: Option<String>,
    pub prior_exec_id: Option<String>,
    pub prior_manifest_sha256: Option<String>,
    pub context: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOnce {
    /// Any existing bundle is an error.
    Strict,
    /// An identical existing bundle is accepted.
    Identical,
}

/// Report produced by [`verify_bundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleReport {
    pub dir: PathBuf,
    pub manifest_sha256: String,
    pub problems: Vec<String>,
}

impl BundleReport {
    pub fn ok(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn execution_dir(&self, task_id: &str, exec_id: &str) -> PathBuf {
        self.root.join(task_id).join(exec_id)
    }

    pub fn verification_dir(&self, spec_sha256: &str) -> PathBuf {
        self.root.join("verify").join(spec_sha256)
    }

    pub fn rejection_id(reason: &str) -> String {
        sha256_hex(reason)[..16].to_string()
    }

    pub fn rejection_dir(&self, task_id: &str, reason: &str) -> PathBuf {
        self.root
            .join(task_id)
            .join("rejections")
            .join(Self::rejection_id(reason))
    }

    /// Seal an execution. Fails if a bundle for `(task_id, exec_id)` exists.
    #[instrument(skip_all, fields(task_id = %record.spec.task_id, exec_id = %record.spec.exec_id, outcome = %record.outcome))]
    pub fn write_execution_bundle(&self, record: &ExecutionRecord<'_>) -> Result<BundleRef> {
        let spec = record.spec;
        validate_task_id(&spec.task_id)?;
        validate_exec_id(&spec.exec_id)?;
        let spec_json = spec.canonical_json()?;
        let spec_sha256 = sha256_hex(&spec_json);

        let mut files = BTreeMap::new();
        files.insert(EXEC_SPEC_FILE.to_string(), spec_json.into_bytes());
        files.insert(STDOUT_FILE.to_string(), record.stdout.to_vec());
        files.insert(STDERR_FILE.to_string(), record.stderr.to_vec());
        for (name, bytes) in record.outputs {
            check_relative_name(name)?;
            files.insert(format!("{OUTPUTS_DIR}/{name}"), bytes.clone());
        }

        let summary = json!({
            "task_id": spec.task_id,
            "exec_id": spec.exec_id,
            "outcome": record.outcome,
            "reason": record.reason,
            "idempotency_key": record.idempotency_key,
            "spec_sha256": spec_sha256,
        });
        let dest = self.execution_dir(&spec.task_id, &spec.exec_id);
        self.publish(&dest, files, summary, WriteOnce::Strict)
    }

    /// Record a verification decision keyed by `spec_sha256`.
    #[instrument(skip(self, decision))]
    pub fn write_verification_bundle(
        &self,
        spec_sha256: &str,
        decision: &Value,
        reason: &str,
    ) -> Result<BundleRef> {
        if !is_sha256_hex(spec_sha256) {
            return Err(anyhow!("verification key is not a sha256: {spec_sha256}"));
        }
        let mut files = BTreeMap::new();
        files.insert(
            DECISION_FILE.to_string(),
            canonical_json(decision)?.into_bytes(),
        );
        let summary = json!({
            "kind": "verification",
            "reason": reason,
            "spec_sha256": spec_sha256,
        });
        let dest = self.verification_dir(spec_sha256);
        self.publish(&dest, files, summary, WriteOnce::Identical)
    }

    /// Record a refusal under `<task_id>/rejections/<sha256(reason)[:16]>`.
    #[instrument(skip_all, fields(task_id = %rejection.task_id, reason = %rejection.reason))]
    pub fn write_rejection_bundle(&self, rejection: &RejectionRecord) -> Result<BundleRef> {
        validate_task_id(&rejection.task_id)?;
        let body = json!({
            "schema_version": SCHEMA_VERSION,
            "task_id": rejection.task_id,
            "outcome": ExecutionOutcome::Rejected,
            "reason": rejection.reason,
            "exec_id": rejection.exec_id,
            "spec_sha256": rejection.spec_sha256,
            "idempotency_key": rejection.idempotency_key,
            "prior_exec_id": rejection.prior_exec_id,
            "prior_manifest_sha256": rejection.prior_manifest_sha256,
            "context": rejection.context,
        });
        let mut files = BTreeMap::new();
        files.insert(REJECTION_FILE.to_string(), canonical_json(&body)?.into_bytes());
        let summary = json!({
            "task_id": rejection.task_id,
            "exec_id": rejection.exec_id,
            "outcome": ExecutionOutcome::Rejected,
            "reason": rejection.reason,
            "idempotency_key": rejection.idempotency_key,
            "spec_sha256": rejection.spec_sha256,
        });
        let dest = self.rejection_dir(&rejection.task_id, &rejection.reason);
        self.publish(&dest, files, summary, WriteOnce::Identical)
    }

    /// Write a rejection bundle, keeping the first record for a reason.
    ///
    /// The bundle key is derived from the reason alone, so two refusals with the
    /// same reason but different context collide. The first bundle stays
    /// authoritative and is returned instead of failing the refusal path.
    pub fn record_rejection(&self, rejection: &RejectionRecord) -> Result<BundleRef> {
        match self.write_rejection_bundle(rejection) {
            Ok(bundle) => Ok(bundle),
            Err(err) if matches!(kernel_error(&err), Some(KernelError::EvidenceCollision { .. })) => {
                let dir = self.rejection_dir(&rejection.task_id, &rejection.reason);
                warn!(dir = %dir.display(), "rejection already recorded with other context");
                load_bundle_ref(&dir)
            }
            Err(err) => Err(err),
        }
    }

    /// Read an execution bundle's summary.
    pub fn read_execution_summary(&self, task_id: &str, exec_id: &str) -> Result<ExecutionSummary> {
        let path = self.execution_dir(task_id, exec_id).join(SUMMARY_FILE);
        let raw = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
    }

    fn publish(
        &self,
        dest: &Path,
        files: BTreeMap<String, Vec<u8>>,
        summary: Value,
        mode: WriteOnce,
    ) -> Result<BundleRef> {
        let mut rendered = render_bundle(files, summary)?;
        rendered.bundle.dir = dest.to_path_buf();
        if dest.exists() {
            return self.accept_existing(dest, &rendered, mode);
        }

        let staged = staging_path(dest);
        for (rel, bytes) in &rendered.files {
            let path = staged.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        }
        if mode == WriteOnce::Strict {
            // Execution bundles always carry an outputs/ directory, even when empty.
            let outputs = staged.join(OUTPUTS_DIR);
            fs::create_dir_all(&outputs)
                .with_context(|| format!("create {}", outputs.display()))?;
        }

        if !publish_dir(&staged, dest)? {
            return self.accept_existing(dest, &rendered, mode);
        }
        info!(dir = %dest.display(), manifest_sha256 = %rendered.bundle.manifest_sha256, "published evidence bundle");
        Ok(rendered.bundle)
    }

    fn accept_existing(&self, dest: &Path, rendered: &Rendered, mode: WriteOnce) -> Result<BundleRef> {
        if mode == WriteOnce::Strict {
            warn!(dir = %dest.display(), "refusing to overwrite evidence bundle");
            return Err(KernelError::BundleExists {
                path: dest.to_path_buf(),
            }
            .into());
        }
        let existing = list_files(dest)?;
        let expected: BTreeSet<&String> = rendered.files.keys().collect();
        let same_set = existing.iter().collect::<BTreeSet<_>>() == expected;
        let mut same_bytes = same_set;
        if same_set {
            for (rel, bytes) in &rendered.files {
                let on_disk = fs::read(dest.join(rel))
                    .with_context(|| format!("read {}", dest.join(rel).display()))?;
                if &on_disk != bytes {
                    same_bytes = false;
                    break;
                }
            }
        }
        if !same_bytes {
            warn!(dir = %dest.display(), "evidence collision");
            return Err(KernelError::EvidenceCollision {
                path: dest.to_path_buf(),
            }
            .into());
        }
        debug!(dir = %dest.display(), "identical bundle already present");
        Ok(rendered.bundle.clone())
    }
}

struct Rendered {
    files: BTreeMap<String, Vec<u8>>,
    bundle: BundleRef,
}

/// Add the manifest and summary to `files`, all in canonical form.
fn render_bundle(mut files: BTreeMap<String, Vec<u8>>, summary: Value) -> Result<Rendered> {
    let hashes: BTreeMap<String, String> = files
        .iter()
        .map(|(rel, bytes)| (rel.clone(), sha256_hex(bytes)))
        .collect();
    let manifest = canonical_json(&json!({ "files": hashes }))?;
    let manifest_sha256 = sha256_hex(&manifest);

    let mut summary = match canonical_value(&summary) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    summary.insert("schema_version".to_string(), json!(SCHEMA_VERSION));
    summary.insert("manifest_sha256".to_string(), json!(manifest_sha256));
    let summary = canonical_json(&Value::Object(summary))?;

    files.insert(MANIFEST_FILE.to_string(), manifest.into_bytes());
    files.insert(SUMMARY_FILE.to_string(), summary.into_bytes());
    Ok(Rendered {
        files,
        bundle: BundleRef {
            dir: PathBuf::new(),
            manifest_sha256,
            files: hashes,
        },
    })
}

fn check_relative_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let clean = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(())
    } else {
        Err(anyhow!("output name must be a plain relative path: {name:?}"))
    }
}

/// All regular files under `dir`, as `/`-joined relative paths.
fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).with_context(|| format!("read {}", current.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", current.display()))?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let rel = path
                .strip_prefix(dir)
                .with_context(|| format!("relativize {}", path.display()))?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(parts.join("/"));
        }
    }
    out.sort();
    Ok(out)
}

/// Describe an existing bundle from its manifest.
pub fn load_bundle_ref(dir: &Path) -> Result<BundleRef> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw =
        fs::read(&manifest_path).with_context(|| format!("read {}", manifest_path.display()))?;
    #[derive(Deserialize)]
    struct Manifest {
        files: BTreeMap<String, String>,
    }
    let manifest: Manifest = serde_json::from_slice(&raw)
        .with_context(|| format!("parse {}", manifest_path.display()))?;
    Ok(BundleRef {
        dir: dir.to_path_buf(),
        manifest_sha256: sha256_hex(&raw),
        files: manifest.files,
    })
}

/// Re-hash a bundle against its manifest and summary.
pub fn verify_bundle(dir: &Path) -> Result<BundleReport> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest_raw =
        fs::read(&manifest_path).with_context(|| format!("read {}", manifest_path.display()))?;
    let manifest_sha256 = sha256_hex(&manifest_raw);
    let mut problems = Vec::new();

    let manifest: Value = serde_json::from_slice(&manifest_raw)
        .with_context(|| format!("parse {}", manifest_path.display()))?;
    let listed: BTreeMap<String, String> = match manifest.get("files") {
        Some(files) => serde_json::from_value(files.clone())
            .with_context(|| format!("parse files in {}", manifest_path.display()))?,
        None => {
            problems.push("manifest has no files map".to_string());
            BTreeMap::new()
        }
    };
    if canonical_json(&manifest)?.as_bytes() != manifest_raw.as_slice() {
        problems.push("manifest is not canonical".to_string());
    }

    for (rel, expected) in &listed {
        match fs::read(dir.join(rel)) {
            Ok(bytes) if &sha256_hex(&bytes) == expected => {}
            Ok(_) => problems.push(format!("hash mismatch: {rel}")),
            Err(_) => problems.push(format!("missing file: {rel}")),
        }
    }
    for rel in list_files(dir)? {
        if rel != MANIFEST_FILE && rel != SUMMARY_FILE && !listed.contains_key(&rel) {
            problems.push(format!("unlisted file: {rel}"));
        }
    }

    let summary_path = dir.join(SUMMARY_FILE);
    if summary_path.exists() {
        let raw =
            fs::read(&summary_path).with_context(|| format!("read {}", summary_path.display()))?;
        let summary: Value = serde_json::from_slice(&raw)
            .with_context(|| format!("parse {}", summary_path.display()))?;
        if summary.get("manifest_sha256").and_then(Value::as_str) != Some(manifest_sha256.as_str())
        {
            problems.push("run_summary.manifest_sha256 does not match manifest".to_string());
        }
    } else {
        problems.push("missing run_summary.json".to_string());
    }

    Ok(BundleReport {
        dir: dir.to_path_buf(),
        manifest_sha256,
        problems,
    })
}
