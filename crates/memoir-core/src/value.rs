use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};
use crate::hash::{hash_bytes, hash_value, CanonicalValue};
use crate::uid::Uid;

/// Marker trait for anything that can be stored as a `ValueRef` payload.
///
/// Blanket-implemented, matching `toka_store_core::EventPayload` — any
/// (de)serializable, thread-safe, owned type qualifies.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// The payload of an in-memory value: its serialized bytes plus enough to
/// recompute or verify `content_uid`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ValueData {
    uid: Uid,
    content_uid: Uid,
    obj: Option<Vec<u8>>,
}

/// A content-addressed reference to a value.
///
/// `Value(..)` carries an optional in-memory payload (`obj`); `Delayed(..)`
/// carries only a slot identity and exists solely for the duration of a
/// batched (`call_batch`) execution, per spec §3 and §9.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueRef {
    Value(ValueData),
    Delayed { uid: Uid },
}

impl ValueRef {
    /// Wrap an already-serialized payload as a fresh value.
    ///
    /// `uid` equals `content_uid` until the value is emitted as a call
    /// output, at which point [`wrap_outputs`] attaches the causal part.
    pub fn wrap_bytes(payload: &[u8]) -> Self {
        let content_uid = hash_bytes(payload);
        ValueRef::Value(ValueData {
            uid: content_uid.clone(),
            content_uid,
            obj: Some(payload.to_vec()),
        })
    }

    /// Wrap a typed object: serialize it (MessagePack, matching every
    /// storage crate in the teacher workspace) and hash the bytes.
    pub fn wrap<T: Payload>(obj: &T) -> Result<Self> {
        let bytes = rmp_serde::to_vec_named(obj)
            .map_err(|e| Error::InvalidSignatureChange(format!("payload serialization: {e}")))?;
        Ok(Self::wrap_bytes(&bytes))
    }

    /// Construct a reference that only knows its UIDs — the in-memory
    /// payload must be loaded separately (`in_memory() == false`).
    pub fn lazy(uid: Uid, content_uid: Uid) -> Self {
        ValueRef::Value(ValueData {
            uid,
            content_uid,
            obj: None,
        })
    }

    /// A placeholder used only inside a batched workflow before its
    /// producing call has actually run.
    pub fn new_delayed(slot_uid: Uid) -> Self {
        ValueRef::Delayed { uid: slot_uid }
    }

    pub fn is_delayed(&self) -> bool {
        matches!(self, ValueRef::Delayed { .. })
    }

    pub fn uid(&self) -> &Uid {
        match self {
            ValueRef::Value(v) => &v.uid,
            ValueRef::Delayed { uid } => uid,
        }
    }

    /// The content-only identity. Panics if called on a `Delayed` ref, which
    /// by definition has no content yet — callers must resolve delayed
    /// outputs before treating them as values (see `SimpleWorkflowExecutor`).
    pub fn content_uid(&self) -> &Uid {
        match self {
            ValueRef::Value(v) => &v.content_uid,
            ValueRef::Delayed { .. } => {
                panic!("content_uid requested on an unresolved Delayed value")
            }
        }
    }

    pub fn in_memory(&self) -> bool {
        matches!(self, ValueRef::Value(ValueData { obj: Some(_), .. }))
    }

    /// Attach a loaded payload to a previously lazy reference.
    pub fn with_loaded_bytes(&self, bytes: Vec<u8>) -> Self {
        match self {
            ValueRef::Value(v) => ValueRef::Value(ValueData {
                uid: v.uid.clone(),
                content_uid: v.content_uid.clone(),
                obj: Some(bytes),
            }),
            ValueRef::Delayed { uid } => ValueRef::Delayed { uid: uid.clone() },
        }
    }

    pub fn payload_bytes(&self) -> Option<&[u8]> {
        match self {
            ValueRef::Value(ValueData { obj: Some(b), .. }) => Some(b),
            _ => None,
        }
    }

    /// Deserialize the in-memory payload.
    pub fn unwrap<T: Payload>(&self) -> Result<T> {
        match self.payload_bytes() {
            Some(bytes) => rmp_serde::from_slice(bytes)
                .map_err(|e| Error::InvalidSignatureChange(format!("payload deserialization: {e}"))),
            None => Err(Error::NotInMemory(self.uid().clone())),
        }
    }
}

/// Wrap freshly computed call outputs, attaching the causal part of the UID:
/// `uid = hash([content_uid, call_uid, output_index])` (spec §6).
pub fn wrap_outputs(output_bytes: &[Vec<u8>], call_uid: &Uid) -> Vec<ValueRef> {
    output_bytes
        .iter()
        .enumerate()
        .map(|(index, bytes)| {
            let content_uid = hash_bytes(bytes);
            let uid = hash_value(&CanonicalValue::List(vec![
                CanonicalValue::Str(content_uid.as_str().to_owned()),
                CanonicalValue::Str(call_uid.as_str().to_owned()),
                CanonicalValue::Int(index as i64),
            ]));
            ValueRef::Value(ValueData {
                uid,
                content_uid,
                obj: Some(bytes.clone()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_round_trips() {
        let v = ValueRef::wrap(&42i64).unwrap();
        assert!(v.in_memory());
        let back: i64 = v.unwrap().unwrap();
        assert_eq!(back, 42);
    }

    #[test]
    fn wrap_is_idempotent_on_content() {
        let a = ValueRef::wrap(&"hello".to_string()).unwrap();
        let b = ValueRef::wrap(&"hello".to_string()).unwrap();
        assert_eq!(a.content_uid(), b.content_uid());
        assert_eq!(a.uid(), b.uid());
    }

    #[test]
    fn output_uids_incorporate_call_and_position() {
        let call_uid = hash_bytes(b"some-call");
        let bytes = rmp_serde::to_vec_named(&1i64).unwrap();
        let outs = wrap_outputs(&[bytes.clone(), bytes], &call_uid);
        assert_eq!(outs[0].content_uid(), outs[1].content_uid());
        assert_ne!(outs[0].uid(), outs[1].uid());
    }

    #[test]
    fn lazy_value_requires_load_before_unwrap() {
        let v = ValueRef::lazy(hash_bytes(b"x"), hash_bytes(b"x"));
        assert!(!v.in_memory());
        assert!(v.unwrap::<i64>().is_err());
    }
}
