//! Content digests used as drift fingerprints.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::model::PolicyObject;

/// Deterministic SHA-256 digest of a policy object's content.
///
/// Any tracking block injected by a previous run is ignored, and object keys
/// are sorted so that the digest does not depend on field order.
pub fn content_hash(policy: &PolicyObject) -> Result<String> {
    let value = serde_json::to_value(policy.without_tracking())?;
    Ok(hash_value(&value))
}

pub fn hash_value(value: &Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
