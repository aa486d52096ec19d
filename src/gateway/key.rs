//! Deterministic call-log keys.
//!
//! Keys hash a canonical JSON rendering where object keys are sorted at every
//! depth, so insertion order inside options or identities never changes a key.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::types::CacheIdentity;

/// 2^53: above this, whole floats keep `serde_json`'s rendering.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Compact JSON with recursively sorted object keys.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Number(n) => match n.as_f64() {
            // Whole floats render as integers (`1.0` -> `1`), so `1.0` and
            // `1` in options share a key.
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER => {
                out.push_str(&(f as i64).to_string())
            }
            _ => out.push_str(&n.to_string()),
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Key for a call that declared a cache identity.
pub fn identity_key(provider: &str, operation: &str, identity: &CacheIdentity) -> String {
    let payload = json!({
        "provider": provider,
        "operation": operation,
        "cacheSchema": identity.schema(),
        "identity": Value::Object(identity.value.clone()),
    });
    sha256_hex(&canonical_json(&payload))
}

/// Key for a call without a cache identity: scoped to the feature and its options.
pub fn feature_key(
    feature_id: &str,
    operation: &str,
    options: &Map<String, Value>,
    input: &str,
) -> String {
    let payload = json!({
        "featureId": feature_id,
        "operation": operation,
        "options": Value::Object(options.clone()),
        "input": input,
    });
    sha256_hex(&canonical_json(&payload))
}
