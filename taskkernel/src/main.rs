//! `taskkernel` command line.
//!
//! Every command prints one JSON document on stdout and exits with a code from
//! [`taskkernel::exit_codes`]. Diagnostics go to stderr.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use taskkernel::core::policy::RoleRegistry;
use taskkernel::core::types::{EvalDecision, Task};
use taskkernel::error::{KernelError, kernel_error};
use taskkernel::evaluation::{cancel_task, create_refinement_task, evaluate_task};
use taskkernel::exit_codes;
use taskkernel::guard::{AttemptGuard, IdempotencyGuard, Unguarded};
use taskkernel::io::config::KernelConfig;
use taskkernel::io::event_store::FsEventStore;
use taskkernel::io::evidence::{EvidenceStore, verify_bundle};
use taskkernel::io::executor::LocalExecutor;
use taskkernel::io::idempotency::IdempotencyLedger;
use taskkernel::io::init::{InitOptions, KernelPaths, init_kernel};
use taskkernel::logging;
use taskkernel::router::ExecutionRouter;
use taskkernel::runner::TaskRunner;
use taskkernel::state::rebuild_task_state;
use taskkernel::verify::{PlanStep, verify_plan, verify_task};

#[derive(Parser)]
#[command(
    name = "taskkernel",
    version,
    about = "Deterministic task-orchestration kernel"
)]
struct Cli {
    /// Kernel root holding `taskkernel.toml`, the store and evidence.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the store layout and a default `taskkernel.toml`.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Declare and verify a task read from a JSON file.
    Verify { task_file: PathBuf },
    /// Decide every step of a JSON plan without executing anything.
    Plan { plan_file: PathBuf },
    /// Print a task's replayed state.
    State { task_id: String },
    /// Check a task's hash chain.
    VerifyChain { task_id: String },
    /// Dispatch a verified task.
    Route { task_id: String },
    /// Execute a dispatched task at most once.
    Run {
        task_id: String,
        /// Skip the idempotency ledger.
        #[arg(long)]
        unguarded: bool,
    },
    /// Record a verdict on a completed task.
    Evaluate {
        task_id: String,
        #[arg(long)]
        decision: EvalDecision,
        #[arg(long)]
        note: Option<String>,
    },
    /// Create the child task named by a `refine` verdict.
    Refine {
        parent_task_id: String,
        #[arg(long)]
        exec_id: String,
    },
    /// Cancel a task that has not started running.
    Cancel {
        task_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Re-hash an evidence bundle against its manifest.
    CheckBundle { dir: PathBuf },
}

/// Opened kernel root.
struct Kernel {
    paths: KernelPaths,
    config: KernelConfig,
    events: FsEventStore,
    evidence: EvidenceStore,
    roles: RoleRegistry,
}

impl Kernel {
    fn open(root: &Path) -> Result<Self> {
        let (paths, config) = KernelPaths::load(root)?;
        Ok(Self {
            events: FsEventStore::new(&paths.events_dir),
            evidence: EvidenceStore::new(&paths.evidence_dir),
            roles: RoleRegistry::canonical(),
            paths,
            config,
        })
    }

    fn runner<G: AttemptGuard>(&self, guard: G) -> TaskRunner<LocalExecutor, G> {
        TaskRunner::new(
            self.events.clone(),
            self.evidence.clone(),
            LocalExecutor::new(self.config.output_limit_bytes),
            guard,
            self.config.spec_limits(),
        )
    }

    fn ledger(&self) -> IdempotencyLedger {
        IdempotencyLedger::new(&self.paths.locks_dir, &self.paths.records_dir)
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if let Some(refusal) = kernel_error(&err) {
                print_json(&json!({ "ok": false, "reason": refusal.reason() }));
            }
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Verify { task_file } => cmd_verify(&Kernel::open(root)?, &task_file),
        Command::Plan { plan_file } => cmd_plan(&Kernel::open(root)?, &plan_file),
        Command::State { task_id } => cmd_state(&Kernel::open(root)?, &task_id),
        Command::VerifyChain { task_id } => cmd_verify_chain(&Kernel::open(root)?, &task_id),
        Command::Route { task_id } => cmd_route(&Kernel::open(root)?, &task_id),
        Command::Run { task_id, unguarded } => {
            let kernel = Kernel::open(root)?;
            if unguarded {
                cmd_run(&kernel, &task_id, Unguarded)
            } else {
                cmd_run(&kernel, &task_id, IdempotencyGuard::new(kernel.ledger()))
            }
        }
        Command::Evaluate {
            task_id,
            decision,
            note,
        } => {
            let kernel = Kernel::open(root)?;
            let evaluation = evaluate_task(
                &kernel.events,
                &kernel.evidence,
                &task_id,
                decision,
                note.as_deref(),
            )?;
            print_json(&evaluation);
            Ok(exit_codes::OK)
        }
        Command::Refine {
            parent_task_id,
            exec_id,
        } => {
            let kernel = Kernel::open(root)?;
            let refinement = create_refinement_task(
                &kernel.events,
                &kernel.evidence,
                &kernel.roles,
                &parent_task_id,
                &exec_id,
            )?;
            print_json(&refinement);
            Ok(exit_codes::OK)
        }
        Command::Cancel { task_id, reason } => {
            let kernel = Kernel::open(root)?;
            let event = cancel_task(&kernel.events, &task_id, &reason)?;
            print_json(&json!({ "ok": true, "task_id": task_id, "seq": event.seq }));
            Ok(exit_codes::OK)
        }
        Command::CheckBundle { dir } => {
            let report = verify_bundle(&dir)?;
            print_json(&report);
            Ok(if report.ok() {
                exit_codes::OK
            } else {
                exit_codes::INTEGRITY
            })
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_kernel(root, &InitOptions { force })?;
    print_json(&json!({
        "ok": true,
        "config": paths.config_path,
        "events": paths.events_dir,
        "evidence": paths.evidence_dir,
    }));
    Ok(exit_codes::OK)
}

fn cmd_verify(kernel: &Kernel, task_file: &Path) -> Result<i32> {
    let task: Task = read_json(task_file)?;
    let verified = verify_task(&kernel.events, &kernel.evidence, &kernel.roles, &task)?;
    print_json(&json!({
        "ok": verified.ok,
        "reason": verified.reason,
        "task_id": verified.task_id,
        "seq": verified.verified.as_ref().map(|event| event.seq),
        "rejection": verified.rejection.as_ref().map(|bundle| &bundle.dir),
    }));
    Ok(if verified.ok {
        exit_codes::OK
    } else {
        exit_codes::DENIED
    })
}

fn cmd_plan(kernel: &Kernel, plan_file: &Path) -> Result<i32> {
    let steps: Vec<PlanStep> = read_json(plan_file)?;
    let plan = verify_plan(&kernel.evidence, &kernel.roles, &steps)?;
    print_json(&json!({
        "ok": plan.ok,
        "plan_sha256": plan.plan_sha256,
        "decisions": plan.decisions,
        "manifest_sha256": plan.bundle.manifest_sha256,
    }));
    Ok(if plan.ok {
        exit_codes::OK
    } else {
        exit_codes::DENIED
    })
}

fn cmd_state(kernel: &Kernel, task_id: &str) -> Result<i32> {
    let snapshot = rebuild_task_state(&kernel.events, task_id)?;
    print_json(&json!({
        "task_id": snapshot.task_id,
        "state": snapshot.state,
        "events": snapshot.history.len(),
        "head": snapshot.history.last().map(|event| &event.hash),
    }));
    Ok(exit_codes::OK)
}

fn cmd_verify_chain(kernel: &Kernel, task_id: &str) -> Result<i32> {
    kernel.events.check_chain(task_id)?;
    print_json(&json!({ "ok": true, "task_id": task_id }));
    Ok(exit_codes::OK)
}

fn cmd_route(kernel: &Kernel, task_id: &str) -> Result<i32> {
    // Routing acts on the declaration recorded at verification time.
    let snapshot = rebuild_task_state(&kernel.events, task_id)?;
    let Some(created) = snapshot.created() else {
        return Err(KernelError::InvalidState {
            task_id: task_id.to_string(),
            state: snapshot.state,
        }
        .into());
    };
    let task = Task {
        task_id: task_id.to_string(),
        role: created.role,
        action: created.action,
        payload: created.payload,
        attempt: created.attempt,
    };
    let routed = ExecutionRouter::new(&kernel.events, &kernel.roles).route(&task)?;
    print_json(&routed);
    Ok(if routed.ok {
        exit_codes::OK
    } else {
        exit_codes::DENIED
    })
}

fn cmd_run<G: AttemptGuard>(kernel: &Kernel, task_id: &str, guard: G) -> Result<i32> {
    let summary = kernel.runner(guard).run_dispatched(task_id)?;
    print_json(&summary);
    Ok(if summary.ok {
        exit_codes::OK
    } else {
        exit_codes::RUN_FAILED
    })
}

/// Map an error to its exit code. Only kernel refusals are distinguished.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match kernel_error(err) {
        Some(KernelError::LockHeld { .. } | KernelError::EventExists { .. }) => exit_codes::BUSY,
        Some(KernelError::ChainMismatch { .. } | KernelError::EvidenceCollision { .. }) => {
            exit_codes::INTEGRITY
        }
        Some(_) => exit_codes::DENIED,
        None => exit_codes::INVALID,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(payload) => println!("{payload}"),
        Err(err) => eprintln!("serialize output: {err}"),
    }
}
