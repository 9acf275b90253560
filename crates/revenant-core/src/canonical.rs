//! Versioned canonical JSON shared verbatim by every signer and verifier.
//!
//! Objects are emitted with keys sorted by byte order, no whitespace, `,` and `:` separators.
//! Any change to this output breaks every existing backup signature and MUST come with a new
//! [`CANONICAL_ENCODING_VERSION`].

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

pub const CANONICAL_ENCODING_VERSION: &str = "canonical-json.v1";

#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Serialize any value through [`canonical_json`].
///
/// # Errors
/// Returns [`CoreError::Encoding`] when the value cannot be represented as JSON.
pub fn canonical_json_of<T: Serialize>(value: &T) -> CoreResult<String> {
    let value = serde_json::to_value(value)
        .map_err(|err| CoreError::Encoding(format!("failed to encode canonical JSON: {err}")))?;
    Ok(canonical_json(&value))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(lhs, _), (rhs, _)| lhs.as_bytes().cmp(rhs.as_bytes()));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

#[must_use]
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_sorted_regardless_of_insertion_order() {
        let mut forward = serde_json::Map::new();
        forward.insert("b".to_string(), Value::from(1));
        forward.insert("a".to_string(), serde_json::json!({"z": true, "y": null}));
        let mut reverse = serde_json::Map::new();
        reverse.insert("a".to_string(), serde_json::json!({"y": null, "z": true}));
        reverse.insert("b".to_string(), Value::from(1));

        let lhs = canonical_json(&Value::Object(forward));
        let rhs = canonical_json(&Value::Object(reverse));
        assert_eq!(lhs, rhs);
        assert_eq!(lhs, r#"{"a":{"y":null,"z":true},"b":1}"#);
    }

    #[test]
    fn strings_are_escaped() {
        let value = serde_json::json!({"name": "a\"b\n"});
        assert_eq!(canonical_json(&value), r#"{"name":"a\"b\n"}"#);
    }
}
