//! Kernel configuration stored in `<root>/taskkernel.toml`.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::spec::SpecLimits;
use crate::io::atomic::write_atomic;

pub const CONFIG_FILE: &str = "taskkernel.toml";

/// Kernel configuration (TOML).
///
/// Meant to be edited by humans. Missing fields default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// Event log and idempotency ledger, relative to the root.
    pub store_dir: PathBuf,

    /// Evidence bundles, relative to the root.
    pub evidence_dir: PathBuf,

    /// Keep at most this many bytes of each of stdout/stderr.
    pub output_limit_bytes: usize,

    /// Upper bound accepted for a payload's `timeout_s`.
    pub max_timeout_s: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("store"),
            evidence_dir: PathBuf::from("evidence"),
            output_limit_bytes: 8 * 1024 * 1024,
            max_timeout_s: 60 * 60,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_timeout_s == 0 {
            return Err(anyhow!("max_timeout_s must be > 0"));
        }
        check_relative("store_dir", &self.store_dir)?;
        check_relative("evidence_dir", &self.evidence_dir)?;
        Ok(())
    }

    pub fn spec_limits(&self) -> SpecLimits {
        SpecLimits {
            max_timeout_s: self.max_timeout_s,
        }
    }
}

fn check_relative(field: &str, path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.as_os_str().is_empty() || escapes {
        return Err(anyhow!(
            "{field} must be a relative path inside the root, got {}",
            path.display()
        ));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &KernelConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, KernelConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        let cfg = KernelConfig {
            max_timeout_s: 30,
            ..KernelConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "max_timeout_s = 10\n").expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded.max_timeout_s, 10);
        assert_eq!(loaded.store_dir, PathBuf::from("store"));
    }

    #[test]
    fn escaping_dirs_are_rejected() {
        let cfg = KernelConfig {
            evidence_dir: PathBuf::from("../elsewhere"),
            ..KernelConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = KernelConfig {
            store_dir: PathBuf::from("/abs"),
            ..KernelConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
