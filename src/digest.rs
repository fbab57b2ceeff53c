//! Canonical argument encoding and task digests
//!
//! One definition shared by the cache key and the loop detector:
//! object keys are sorted at every depth, so argument insertion order
//! never changes the digest.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic, order-independent JSON text for an argument set.
pub fn canonicalize(value: &Value) -> String {
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
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 hex digest of `capability` + canonical `args` (64 chars).
pub fn task_digest(capability: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(capability.as_bytes());
    hasher.update(b"|");
    hasher.update(canonicalize(args).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonicalize_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": true, "x": null}], "c": "s"}});
        assert_eq!(
            canonicalize(&value),
            r#"{"a":{"c":"s","z":[3,{"x":null,"y":true}]},"b":1}"#
        );
    }

    #[test]
    fn test_digest_ignores_insertion_order() {
        let mut first = serde_json::Map::new();
        first.insert("ticker".into(), json!("AAPL"));
        first.insert("period".into(), json!("quarterly"));
        first.insert("limit".into(), json!(4));

        let mut second = serde_json::Map::new();
        second.insert("limit".into(), json!(4));
        second.insert("ticker".into(), json!("AAPL"));
        second.insert("period".into(), json!("quarterly"));

        let a = task_digest("income-statements", &Value::Object(first));
        let b = task_digest("income-statements", &Value::Object(second));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_digest_separates_capabilities_and_values() {
        let args = json!({"ticker": "AAPL"});
        assert_ne!(
            task_digest("income-statements", &args),
            task_digest("balance-sheets", &args)
        );
        assert_ne!(
            task_digest("prices", &json!({"limit": 1})),
            task_digest("prices", &json!({"limit": "1"}))
        );
    }
}
