//! Identifier validation.
//!
//! Task and exec ids become single path components on disk, so they are
//! restricted to a conservative character set.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::KernelError;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,199}$").unwrap());

/// Directory names the evidence layout reserves for itself.
const RESERVED: [&str; 2] = ["verify", "rejections"];

pub fn validate_task_id(value: &str) -> Result<(), KernelError> {
    validate("task_id", value)
}

pub fn validate_exec_id(value: &str) -> Result<(), KernelError> {
    validate("exec_id", value)
}

fn validate(field: &'static str, value: &str) -> Result<(), KernelError> {
    if ID_RE.is_match(value) && !RESERVED.contains(&value) && !value.contains("..") {
        return Ok(());
    }
    Err(KernelError::InvalidId {
        field,
        value: value.to_string(),
    })
}
