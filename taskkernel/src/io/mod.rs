//! I/O layer: everything that touches the filesystem or spawns processes.

pub mod atomic;
pub mod config;
pub mod event_store;
pub mod evidence;
pub mod executor;
pub mod idempotency;
pub mod init;
pub mod preflight;
pub mod process;
