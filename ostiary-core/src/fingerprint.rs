//! Canonical JSON and SHA-256 fingerprints
//!
//! Every content hash in the pipeline (definition digests, replay keys,
//! result fingerprints, audit chain hashes) is computed over canonical JSON:
//! object keys sorted recursively, compact output.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Length of a lowercase hex SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// Recursively sort object keys
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical, compact JSON text for a value
pub fn canonical_json(value: &Value) -> String {
    // serde_json without `preserve_order` keeps object keys in a BTreeMap, so
    // this is already sorted; canonicalize anyway so feature unification in a
    // downstream build cannot change hashes.
    canonicalize(value).to_string()
}

/// Canonical JSON for any serializable value
pub fn canonical_json_of<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(canonical_json(&serde_json::to_value(value)?))
}

/// Lowercase hex SHA-256 of raw bytes
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of a JSON value: SHA-256 of its canonical form
pub fn fingerprint(value: &Value) -> String {
    sha256_hex(canonical_json(value))
}

/// Whether a string looks like a lowercase hex SHA-256 digest
pub fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
