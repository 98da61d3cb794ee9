//! Canonical JSON rendering and SHA-256 digests.
//!
//! Hashes in the audit chain and policy fingerprints must be reproducible
//! across implementations, so values are rendered with sorted object keys
//! and no insignificant whitespace before hashing.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value canonically: object keys sorted, compact separators.
///
/// # Errors
///
/// Returns an error if a scalar cannot be rendered by `serde_json`.
pub fn canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out)?;
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the canonical JSON rendering of any serializable value.
///
/// # Errors
///
/// Returns an error if the value cannot be converted to JSON.
pub fn digest_of<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_value(value)?;
    let canonical = canonical_json(&json)?;
    Ok(sha256_hex(canonical.as_bytes()))
}
