//! Content hashing for raw records and downloaded files
//!
//! Raw records are hashed over a canonical JSON encoding (object keys sorted
//! recursively, no insignificant whitespace) so the hash is stable no matter
//! how the upstream API ordered its fields.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hex sha256 of an in-memory buffer
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Canonical sha256 of a JSON value
pub fn content_hash(value: &Value) -> String {
    sha256_hex(&canonical_json(value))
}

/// First `len` hex characters of [`content_hash`]
pub fn short_content_hash(value: &Value, len: usize) -> String {
    let mut hash = content_hash(value);
    hash.truncate(len);
    hash
}

/// Serialize with recursively sorted object keys
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push(b'{');
            for (i, (key, val)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(val, out);
            }
            out.push(b'}');
        },
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        },
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Display for scalars is their compact JSON form
    out.extend_from_slice(value.to_string().as_bytes());
}
