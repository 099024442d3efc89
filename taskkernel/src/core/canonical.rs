//! Canonical JSON and content hashing.
//!
//! Canonical form: object keys sorted by code point, no insignificant
//! whitespace, UTF-8 emitted as-is. Every hash the kernel records (event
//! hashes, `spec_sha256`, manifest hashes) is computed over these bytes, so the
//! byte layout is part of the on-disk contract.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Serialize `value` into canonical JSON bytes.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value).context("serialize canonical json")?;
    Ok(canonical_value(&value).to_string())
}

/// Rebuild `value` with every object's keys inserted in sorted order.
///
/// Independent of whether `serde_json` keeps insertion order, the rebuilt
/// value always serializes with sorted keys.
pub fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonical_value(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

/// Lowercase hex sha256 of `bytes`.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// sha256 of the canonical JSON form of `value`.
pub fn canonical_sha256<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?))
}

/// True when `value` looks like a lowercase hex sha256 digest.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
