//! On-disk layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::config::{CONFIG_FILE, KernelConfig, load_config, write_config};

/// All canonical paths for a kernel root.
#[derive(Debug, Clone)]
pub struct KernelPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub store_dir: PathBuf,
    pub events_dir: PathBuf,
    pub idempotency_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub records_dir: PathBuf,
    pub evidence_dir: PathBuf,
}

impl KernelPaths {
    pub fn new(root: impl Into<PathBuf>, config: &KernelConfig) -> Self {
        let root = root.into();
        let store_dir = root.join(&config.store_dir);
        let idempotency_dir = store_dir.join("idempotency");
        Self {
            config_path: root.join(CONFIG_FILE),
            events_dir: store_dir.join("events"),
            locks_dir: idempotency_dir.join("locks"),
            records_dir: idempotency_dir.join("records"),
            idempotency_dir,
            evidence_dir: root.join(&config.evidence_dir),
            store_dir,
            root,
        }
    }

    /// Load `<root>/taskkernel.toml` (or defaults) and resolve paths.
    pub fn load(root: &Path) -> Result<(Self, KernelConfig)> {
        let config = load_config(&root.join(CONFIG_FILE))?;
        Ok((Self::new(root, &config), config))
    }
}

/// Options for `init_kernel`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

/// Create the directory layout and a default config.
pub fn init_kernel(root: &Path, options: &InitOptions) -> Result<KernelPaths> {
    let config_path = root.join(CONFIG_FILE);
    let config = if options.force || !config_path.exists() {
        let config = KernelConfig::default();
        write_config(&config_path, &config)?;
        config
    } else {
        load_config(&config_path)?
    };

    let paths = KernelPaths::new(root, &config);
    for dir in [
        &paths.events_dir,
        &paths.locks_dir,
        &paths.records_dir,
        &paths.evidence_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    info!(root = %root.display(), "initialized kernel root");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_layout_and_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_kernel(temp.path(), &InitOptions { force: false }).expect("init");
        assert!(paths.config_path.is_file());
        assert!(paths.events_dir.is_dir());
        assert!(paths.locks_dir.is_dir());
        assert!(paths.records_dir.is_dir());
        assert!(paths.evidence_dir.is_dir());
    }

    #[test]
    fn init_keeps_existing_config_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join(CONFIG_FILE);
        fs::write(&config_path, "evidence_dir = \"proof\"\n").expect("write");

        let paths = init_kernel(temp.path(), &InitOptions { force: false }).expect("init");
        assert_eq!(paths.evidence_dir, temp.path().join("proof"));

        let paths = init_kernel(temp.path(), &InitOptions { force: true }).expect("init");
        assert_eq!(paths.evidence_dir, temp.path().join("evidence"));
    }
}
