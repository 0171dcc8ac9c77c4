//! Dataset key hashing
//!
//! Dataset keys are md5 hex digests so that tooling which inspects keys keeps
//! working. A key is derived from the canonical (key-sorted) JSON form of the
//! dataset parameters, the dataset label and the parent key.

use serde_json::{Map, Value};

use crate::error::Result;

/// md5 hex digest of a string
pub fn digest_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Recursively rebuild a value so that every object has its keys in
/// lexicographic order, whatever the insertion order was.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(canonical_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_map(map: &Map<String, Value>) -> Map<String, Value> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut sorted = Map::new();
    for key in keys {
        if let Some(value) = map.get(key) {
            sorted.insert(key.clone(), canonicalize(value));
        }
    }
    sorted
}

/// Serialise parameters in canonical form
pub fn canonical_json(parameters: &Map<String, Value>) -> Result<String> {
    Ok(serde_json::to_string(&Value::Object(canonical_map(parameters)))?)
}

/// Derive a deterministic dataset key
pub fn derive_key(
    parameters: &Map<String, Value>,
    label: &str,
    parent_key: Option<&str>,
) -> Result<String> {
    let plain = format!(
        "{}{}{}",
        canonical_json(parameters)?,
        label,
        parent_key.unwrap_or("")
    );
    Ok(digest_hex(&plain))
}

/// Key from a fresh random nonce; never reproducible
pub fn random_key() -> String {
    digest_hex(&uuid::Uuid::new_v4().to_string())
}
