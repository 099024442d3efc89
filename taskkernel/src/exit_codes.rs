//! Stable exit codes.
//!
//! CLI codes are small integers. The two executor sentinels are recorded in
//! evidence as a command's exit code and never collide with the CLI codes.

/// Command succeeded.
pub const OK: i32 = 0;
/// Operational error: bad arguments, unreadable files, broken config.
pub const INVALID: i32 = 1;
/// The kernel refused on purpose (policy, state, duplicate, path boundary).
pub const DENIED: i32 = 2;
/// Another caller holds the attempt lock; retrying later may succeed.
pub const BUSY: i32 = 3;
/// Hash chain or evidence bundle failed verification.
pub const INTEGRITY: i32 = 4;
/// A dispatched run ended in FAILED.
pub const RUN_FAILED: i32 = 5;

/// Recorded exit code for a command killed by its timeout.
pub const TIMEOUT: i32 = 124;
/// Recorded exit code when the executor itself failed (spawn error, I/O).
pub const EXECUTOR_EXCEPTION: i32 = 125;
