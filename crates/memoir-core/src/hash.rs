//! Deterministic content hashing over a small canonical encoding.
//!
//! Mirrors `toka_store_core::causal_hash`: a BLAKE3 digest over a stable byte
//! encoding, generalized from "payload bytes + sorted parent digests" to
//! "any canonically-encoded composite of UIDs, strings and integers" since
//! the call/output UID formulas in spec §6 hash heterogeneous tuples rather
//! than a flat list of digests.

use std::collections::BTreeMap;

use crate::uid::Uid;

/// A value reduced to the closed set of shapes the hasher understands.
///
/// Only the engine's own identity data (UIDs, names, indices, and the
/// structural builtins' list/dict/set payloads) ever needs to be hashed
/// directly; arbitrary user payloads are hashed as opaque bytes via
/// [`CanonicalValue::Bytes`] after the caller serializes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CanonicalValue {
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<CanonicalValue>),
    /// A mapping, always encoded in key-sorted order regardless of the
    /// insertion order of the source map.
    Map(BTreeMap<String, CanonicalValue>),
}

/// Implemented by anything that can be reduced to a [`CanonicalValue`].
pub trait ToCanonical {
    fn to_canonical(&self) -> CanonicalValue;
}

impl ToCanonical for Uid {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Str(self.as_str().to_owned())
    }
}

impl ToCanonical for str {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Str(self.to_owned())
    }
}

impl ToCanonical for String {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Str(self.clone())
    }
}

impl ToCanonical for i64 {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Int(*self)
    }
}

impl ToCanonical for usize {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Int(*self as i64)
    }
}

impl ToCanonical for [u8] {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Bytes(self.to_vec())
    }
}

impl<T: ToCanonical> ToCanonical for Vec<T> {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::List(self.iter().map(ToCanonical::to_canonical).collect())
    }
}

impl<T: ToCanonical> ToCanonical for [T] {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::List(self.iter().map(ToCanonical::to_canonical).collect())
    }
}

impl<T: ToCanonical> ToCanonical for BTreeMap<String, T> {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Map(
            self.iter()
                .map(|(k, v)| (k.clone(), v.to_canonical()))
                .collect(),
        )
    }
}

impl<T: ToCanonical> ToCanonical for &T {
    fn to_canonical(&self) -> CanonicalValue {
        (*self).to_canonical()
    }
}

impl ToCanonical for CanonicalValue {
    fn to_canonical(&self) -> CanonicalValue {
        self.clone()
    }
}

/// Tag bytes identifying each [`CanonicalValue`] variant in the stable
/// encoding. Never reordered or reused across versions, or every existing
/// UID silently changes meaning.
mod tag {
    pub const STR: u8 = 0;
    pub const INT: u8 = 1;
    pub const BYTES: u8 = 2;
    pub const LIST: u8 = 3;
    pub const MAP: u8 = 4;
}

fn encode_into(value: &CanonicalValue, out: &mut Vec<u8>) {
    match value {
        CanonicalValue::Str(s) => {
            out.push(tag::STR);
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        CanonicalValue::Int(i) => {
            out.push(tag::INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        CanonicalValue::Bytes(b) => {
            out.push(tag::BYTES);
            out.extend_from_slice(&(b.len() as u64).to_le_bytes());
            out.extend_from_slice(b);
        }
        CanonicalValue::List(items) => {
            out.push(tag::LIST);
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                encode_into(item, out);
            }
        }
        CanonicalValue::Map(map) => {
            out.push(tag::MAP);
            out.extend_from_slice(&(map.len() as u64).to_le_bytes());
            // `BTreeMap` iterates in key order already, which is the whole
            // point: two maps built from the same entries in different
            // insertion orders encode identically.
            for (k, v) in map {
                out.extend_from_slice(&(k.len() as u64).to_le_bytes());
                out.extend_from_slice(k.as_bytes());
                encode_into(v, out);
            }
        }
    }
}

/// Canonicalize `value` to bytes suitable for hashing or wire transport.
pub fn canonical_bytes(value: &CanonicalValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Hash an already-canonicalized value.
pub fn hash_canonical(value: &CanonicalValue) -> Uid {
    let bytes = canonical_bytes(value);
    Uid::from_digest(blake3::hash(&bytes))
}

/// Hash anything reducible to a [`CanonicalValue`].
///
/// Equal canonical encodings hash equal; this is the engine's only identity
/// primitive, so every other UID (content, causal, call) is defined in terms
/// of it.
pub fn hash_value<T: ToCanonical + ?Sized>(value: &T) -> Uid {
    hash_canonical(&value.to_canonical())
}

/// Hash raw bytes directly, e.g. a serialized user payload.
pub fn hash_bytes(bytes: &[u8]) -> Uid {
    Uid::from_digest(blake3::hash(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_canonical_encodings_hash_equal() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), CanonicalValue::Int(1));
        a.insert("y".to_string(), CanonicalValue::Int(2));

        // Built via a different insertion order; BTreeMap normalizes it.
        let mut b = BTreeMap::new();
        b.insert("y".to_string(), CanonicalValue::Int(2));
        b.insert("x".to_string(), CanonicalValue::Int(1));

        assert_eq!(
            hash_canonical(&CanonicalValue::Map(a)),
            hash_canonical(&CanonicalValue::Map(b))
        );
    }

    #[test]
    fn distinct_values_hash_distinct() {
        let h1 = hash_value(&"alpha".to_string());
        let h2 = hash_value(&"beta".to_string());
        assert_ne!(h1, h2);
    }

    #[test]
    fn str_and_bytes_tags_do_not_collide() {
        // A string and equal-length byte string must not accidentally share
        // an encoding just because their payload bytes match.
        let s = hash_value(&"ab".to_string());
        let b = hash_bytes(b"ab");
        assert_ne!(s, b);
    }

    proptest::proptest! {
        #[test]
        fn hash_is_deterministic(s in ".*") {
            let h1 = hash_value(&s);
            let h2 = hash_value(&s);
            proptest::prop_assert_eq!(h1, h2);
        }
    }
}
