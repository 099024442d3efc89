//! Deterministic task-orchestration kernel.
//!
//! A task is declared once, gated by policy, executed at most once and leaves
//! hash-verifiable evidence behind. Authoritative task state is never stored:
//! it is derived by replaying a per-task, hash-chained event log. The crate is
//! split the same way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (canonical JSON, typed events, the
//!   transition table, policy decisions, execution specs). No I/O.
//! - **[`io`]**: Side-effecting operations (event files, idempotency ledger,
//!   evidence bundles, process execution). Every mutation is append-only or
//!   write-once.
//!
//! Orchestration modules ([`state`], [`verify`], [`router`], [`runner`],
//! [`evaluation`]) combine the two into the operations the CLI exposes.

pub mod core;
pub mod error;
pub mod evaluation;
pub mod exit_codes;
pub mod guard;
pub mod io;
pub mod logging;
pub mod router;
pub mod runner;
pub mod state;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
