//! # Canonical Encoding
//!
//! Canonical JSON and BLAKE3 content hashes.
//!
//! Canonical form: object keys sorted by byte order at every depth, no
//! insignificant whitespace, numbers and strings as `serde_json` prints them.
//! The same value always yields the same bytes, so hashes and signatures are
//! stable across processes.

use crate::types::GnosisError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// CANONICAL JSON
// =============================================================================

/// Render a JSON value in canonical form.
#[must_use]
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
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(*key) {
                    write_canonical(inner, out);
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
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Serialize any value to canonical JSON bytes.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, GnosisError> {
    let json = serde_json::to_value(value).map_err(|e| GnosisError::Serialization(e.to_string()))?;
    Ok(canonical_json(&json).into_bytes())
}

/// BLAKE3 hash of the canonical JSON form of `value`.
pub fn hash_canonical<T: Serialize + ?Sized>(value: &T) -> Result<ContentHash, GnosisError> {
    let bytes = canonical_bytes(value)?;
    Ok(ContentHash::of(&bytes))
}

// =============================================================================
// CONTENT HASH
// =============================================================================

/// A 32-byte BLAKE3 digest, hex-encoded in every serialized form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = GnosisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| GnosisError::Serialization(e.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| GnosisError::Serialization("content hash must be 32 bytes".into()))?;
        Ok(Self(array))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

// =============================================================================
// CONTENT
// =============================================================================

/// An arbitrary JSON document carried in node payloads and messages.
///
/// Human-readable formats see the raw JSON value. Binary formats (the
/// postcard journal) store the canonical JSON text, since postcard cannot
/// decode self-describing data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Content(pub Value);

impl Content {
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    /// All string leaves and object keys joined by spaces, lowercased.
    /// Used for lexical relevance scoring.
    #[must_use]
    pub fn flatten_text(&self) -> String {
        let mut out = String::new();
        flatten_into(&self.0, &mut out);
        out.to_lowercase()
    }
}

fn flatten_into(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        Value::Array(items) => items.iter().for_each(|item| flatten_into(item, out)),
        Value::Object(map) => {
            for (key, inner) in map {
                out.push_str(key);
                out.push(' ');
                flatten_into(inner, out);
            }
        }
        Value::Number(n) => {
            out.push_str(&n.to_string());
            out.push(' ');
        }
        Value::Bool(_) | Value::Null => {}
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl Serialize for Content {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            serializer.serialize_str(&canonical_json(&self.0))
        }
    }
}

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            Value::deserialize(deserializer).map(Self)
        } else {
            let text = String::deserialize(deserializer)?;
            serde_json::from_str(&text).map(Self).map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [3, {"d": null, "c": "x"}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":[3,{"c":"x","d":null}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn hash_is_independent_of_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(
            hash_canonical(&a).expect("hash"),
            hash_canonical(&b).expect("hash")
        );
    }

    #[test]
    fn content_hash_hex_round_trip() {
        let hash = ContentHash::of(b"gnosis");
        let parsed: ContentHash = hash.to_hex().parse().expect("parse");
        assert_eq!(parsed, hash);
        assert!("abcd".parse::<ContentHash>().is_err());
    }

    #[test]
    fn content_survives_postcard() {
        let content = Content(json!({"name": "self", "levels": [0, 1, 2]}));
        let bytes = postcard::to_allocvec(&content).expect("encode");
        let decoded: Content = postcard::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, content);
    }

    #[test]
    fn content_is_transparent_in_json() {
        let content = Content(json!({"k": "v"}));
        let text = serde_json::to_string(&content).expect("encode");
        assert_eq!(text, r#"{"k":"v"}"#);
    }

    #[test]
    fn flatten_text_collects_keys_and_strings() {
        let content = Content(json!({"Topic": "Sunrise", "notes": ["Warm light"]}));
        let text = content.flatten_text();
        assert!(text.contains("sunrise"));
        assert!(text.contains("warm light"));
        assert!(text.contains("topic"));
    }
}
