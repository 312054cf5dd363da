//! Canonical JSON serialization and stable content hashing
//!
//! Every `*_hash` column in the audit schema is produced here, so two
//! processes observing the same semantic value must derive the same digest.
//! The encoding follows RFC 8785 (JSON Canonicalization Scheme): object keys
//! are sorted by UTF-16 code units, no insignificant whitespace is emitted,
//! and numbers use the shortest round-trip form. Two deviations are
//! deliberate and stricter than the RFC:
//!
//! - `NaN` and ±Infinity are rejected with [`AuditError::InvalidValue`]
//!   rather than encoded as `null`.
//! - Integers outside the safe-integer domain (|n| > 2^53 − 1) are rejected,
//!   because they cannot survive a float round-trip on every consumer.
//!
//! Floats whose mathematical value is integral are emitted without a
//! fractional part, so `2.0` and `2` canonicalize identically and numeric
//! widening does not change a hash.
//!
//! # Examples
//!
//! ```rust
//! use elspeth_landscape::canonical::{canonical_json, stable_hash};
//! use serde_json::json;
//!
//! let a = json!({"b": 1, "a": 2.0});
//! let b = json!({"a": 2, "b": 1});
//! assert_eq!(canonical_json(&a).unwrap(), b"{\"a\":2,\"b\":1}".to_vec());
//! assert_eq!(stable_hash(&a).unwrap(), stable_hash(&b).unwrap());
//! ```

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{AuditError, Result};

/// Identifier for the canonicalization scheme, recorded on every run.
///
/// Bump this whenever the byte encoding changes; hashes produced under
/// different versions are not comparable.
pub const CANONICAL_VERSION: &str = "jcs-1";

/// Largest integer magnitude that survives an f64 round trip (2^53 − 1).
const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Serialize a JSON value to its canonical byte encoding.
///
/// Fails with [`AuditError::InvalidValue`] for NaN, ±Infinity, or integers
/// outside the safe-integer domain.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out)?;
    Ok(out)
}

/// SHA-256 hex digest of the canonical encoding of `value`.
pub fn stable_hash(value: &Value) -> Result<String> {
    Ok(hash_bytes(&canonical_json(value)?))
}

/// SHA-256 hex digest of raw bytes.
///
/// Used by the payload store, where content is addressed by the digest of
/// the stored bytes rather than of a JSON value.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // RFC 8785 orders keys by UTF-16 code units. For BMP-only keys
            // this matches byte order; surrogate pairs sort below unpaired
            // BMP code points >= U+E000, which the comparator handles.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| utf16_cmp(a, b));
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_value(&map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn utf16_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

fn write_number(n: &serde_json::Number, out: &mut Vec<u8>) -> Result<()> {
    if let Some(i) = n.as_i64() {
        if i.unsigned_abs() > MAX_SAFE_INTEGER {
            return Err(AuditError::InvalidValue(format!(
                "integer {i} outside the safe-integer domain"
            )));
        }
        out.extend_from_slice(i.to_string().as_bytes());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        if u > MAX_SAFE_INTEGER {
            return Err(AuditError::InvalidValue(format!(
                "integer {u} outside the safe-integer domain"
            )));
        }
        out.extend_from_slice(u.to_string().as_bytes());
        return Ok(());
    }
    let f = n
        .as_f64()
        .ok_or_else(|| AuditError::InvalidValue("non-finite number".to_string()))?;
    if !f.is_finite() {
        return Err(AuditError::InvalidValue(
            "NaN and infinite floats cannot be canonicalized".to_string(),
        ));
    }
    // Integral floats collapse to their integer form so widening is
    // hash-neutral.
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER as f64 {
        out.extend_from_slice(format!("{}", f as i64).as_bytes());
    } else {
        // Rust's shortest round-trip formatting (Ryū).
        out.extend_from_slice(format!("{f}").as_bytes());
    }
    Ok(())
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\u{0008}' => out.extend_from_slice(b"\\b"),
            '\u{000C}' => out.extend_from_slice(b"\\f"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering() {
        let value = json!({"zulu": 1, "alpha": 2, "mike": 3});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(bytes, b"{\"alpha\":2,\"mike\":3,\"zulu\":1}".to_vec());
    }

    #[test]
    fn test_nested_ordering() {
        let value = json!({"outer": {"b": [1, 2], "a": null}});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"outer":{"a":null,"b":[1,2]}}"#
        );
    }

    #[test]
    fn test_integral_float_collapses() {
        assert_eq!(
            canonical_json(&json!(2.0)).unwrap(),
            canonical_json(&json!(2)).unwrap()
        );
        assert_eq!(
            stable_hash(&json!({"score": 75.0})).unwrap(),
            stable_hash(&json!({"score": 75})).unwrap()
        );
    }

    #[test]
    fn test_fractional_float() {
        assert_eq!(canonical_json(&json!(0.5)).unwrap(), b"0.5".to_vec());
    }

    #[test]
    fn test_unsafe_integer_rejected() {
        let value = json!(9_007_199_254_740_993_i64);
        assert!(matches!(
            canonical_json(&value),
            Err(AuditError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_string_escapes() {
        let value = json!("tab\there\nnewline \u{0001}");
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "\"tab\\there\\nnewline \\u0001\""
        );
    }

    #[test]
    fn test_hash_is_sha256_hex() {
        let hash = stable_hash(&json!({})).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // SHA-256 of "{}"
        assert_eq!(
            hash,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_hash_invariant_under_key_permutation() {
        let a = json!({"id": 1, "score": 75, "tags": ["x", "y"]});
        let b = json!({"tags": ["x", "y"], "score": 75, "id": 1});
        assert_eq!(stable_hash(&a).unwrap(), stable_hash(&b).unwrap());
    }

    #[test]
    fn test_hash_stable_under_deep_copy() {
        let value = json!({"nested": {"list": [1, 2.5, {"k": "v"}]}});
        let copy = value.clone();
        assert_eq!(stable_hash(&value).unwrap(), stable_hash(&copy).unwrap());
    }

    fn arb_json(depth: u32) -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            (-1_000_000i64..1_000_000).prop_map(serde_json::Value::from),
            (-1e9f64..1e9).prop_map(serde_json::Value::from),
            "[a-z]{0,8}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(depth, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_hash_deterministic(value in arb_json(3)) {
            let h1 = stable_hash(&value).unwrap();
            let h2 = stable_hash(&value.clone()).unwrap();
            prop_assert_eq!(h1, h2);
        }

        #[test]
        fn prop_canonical_is_valid_json(value in arb_json(3)) {
            let bytes = canonical_json(&value).unwrap();
            let reparsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(canonical_json(&reparsed).unwrap(), bytes);
        }
    }
}
