//! Executor abstraction for running an [`ExecutionSpec`].
//!
//! The [`Executor`] trait decouples the runner from process spawning. Tests
//! use scripted executors that return predetermined results.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::spec::{ExecKind, ExecutionSpec};
use crate::error::KernelError;
use crate::io::preflight::check_paths;
use crate::io::process::run_bounded;

/// Result of one execution. A timeout is a result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    /// Declared outputs keyed by path relative to the bundle's `outputs/`.
    pub outputs: BTreeMap<String, Vec<u8>>,
}

/// Abstraction over execution backends.
pub trait Executor {
    /// Run `spec`. Errors mean the executor itself failed, not the command.
    fn run(&self, spec: &ExecutionSpec) -> Result<ExecutionResult>;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn run(&self, spec: &ExecutionSpec) -> Result<ExecutionResult> {
        (**self).run(spec)
    }
}

/// Runs argv directly (never through a shell) with an allowlisted environment.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    pub output_limit_bytes: usize,
}

impl LocalExecutor {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }

    fn command(spec: &ExecutionSpec) -> Result<Command, KernelError> {
        let Some((program, args)) = spec.cmd_argv.split_first() else {
            return Err(KernelError::InvalidPayload {
                detail: "cmd_argv is empty".to_string(),
            });
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&spec.cwd).env_clear();
        for name in &spec.env_allowlist {
            if let Some(value) = std::env::var_os(name) {
                cmd.env(name, value);
            }
        }
        Ok(cmd)
    }
}

impl Executor for LocalExecutor {
    #[instrument(skip_all, fields(task_id = %spec.task_id, exec_id = %spec.exec_id, timeout_s = spec.timeout_s))]
    fn run(&self, spec: &ExecutionSpec) -> Result<ExecutionResult> {
        match spec.kind {
            ExecKind::Shell => {}
        }
        check_paths(spec)?;
        let cmd = Self::command(spec)?;

        info!(argv = ?spec.cmd_argv, "executing");
        let output = run_bounded(
            cmd,
            Duration::from_secs(spec.timeout_s),
            self.output_limit_bytes,
        )?;
        Ok(ExecutionResult {
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
            stdout: output.stdout.bytes,
            stderr: output.stderr.bytes,
            outputs: BTreeMap::new(),
        })
    }
}
