//! Deterministic, pure logic shared by the kernel.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for replay and hashing.

pub mod canonical;
pub mod events;
pub mod fsm;
pub mod ids;
pub mod policy;
pub mod spec;
pub mod types;
