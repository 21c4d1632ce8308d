use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::Result;
use crate::signature::Signature;
use crate::uid::Uid;
use crate::value::ValueRef;

/// Inputs handed to a [`FuncOp`]'s compute closure, depending on
/// `Config::autounwrap_inputs`.
pub enum ComputeInputs {
    /// Inputs passed as full `ValueRef`s (the default).
    Wrapped(IndexMap<String, ValueRef>),
    /// Inputs passed as raw serialized payload bytes.
    Raw(IndexMap<String, Vec<u8>>),
}

/// A user function's identity plus (locally) its executable body.
///
/// `func` is only ever `Some` for operations registered in this process;
/// a `FuncOp` reconstructed from a loaded [`Call`] (or learned about purely
/// through remote sync) carries `func: None` and cannot be invoked, only
/// identified and replayed against already-memoized calls.
#[derive(Clone)]
pub struct FuncOp {
    pub sig: Signature,
    func: Option<Arc<dyn Fn(ComputeInputs) -> std::result::Result<Vec<Vec<u8>>, String> + Send + Sync>>,
    /// Structural constructors/destructors (list/dict/set pack+unpack) carry
    /// a fixed orientation and bypass user code entirely.
    pub is_builtin: bool,
    /// Whether this op's signature has been reconciled with the remote.
    pub is_synchronized: bool,
}

impl std::fmt::Debug for FuncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncOp")
            .field("sig", &self.sig.versioned_internal_name())
            .field("has_local_func", &self.func.is_some())
            .field("is_builtin", &self.is_builtin)
            .field("is_synchronized", &self.is_synchronized)
            .finish()
    }
}

impl FuncOp {
    pub fn new(
        sig: Signature,
        func: impl Fn(ComputeInputs) -> std::result::Result<Vec<Vec<u8>>, String> + Send + Sync + 'static,
    ) -> Self {
        FuncOp {
            sig,
            func: Some(Arc::new(func)),
            is_builtin: false,
            is_synchronized: false,
        }
    }

    /// A `FuncOp` known only by signature, with no locally executable body —
    /// the shape produced by `call_get_lazy` and by signatures learned
    /// purely through remote sync.
    pub fn headless(sig: Signature) -> Self {
        FuncOp {
            sig,
            func: None,
            is_builtin: false,
            is_synchronized: false,
        }
    }

    pub fn is_headless(&self) -> bool {
        self.func.is_none()
    }

    pub fn compute(&self, inputs: ComputeInputs) -> Result<Vec<Vec<u8>>> {
        match &self.func {
            Some(f) => f(inputs).map_err(|e| {
                crate::error::Error::InvalidSignatureChange(format!(
                    "`{}` failed: {e}",
                    self.sig.versioned_internal_name()
                ))
            }),
            None => Err(crate::error::Error::SchemaMissing(format!(
                "no local implementation for `{}`",
                self.sig.versioned_internal_name()
            ))),
        }
    }
}

/// An immutable record of one memoized invocation.
///
/// Once constructed a `Call` is never mutated; `set_input_values` and
/// `set_output_values` each derive a new, fully-populated `Call` from a lazy
/// one (UIDs only) plus loaded `ValueRef`s, per spec §4.B.
#[derive(Clone, Debug)]
pub struct Call {
    pub uid: Uid,
    pub func_op: FuncOp,
    pub inputs: IndexMap<String, ValueRef>,
    pub outputs: Vec<ValueRef>,
    /// Mirrors the value table's causal-uid column for schema symmetry; for
    /// a `Call` this always equals `uid` itself, since a call's identity is
    /// already fully causal (a function of its input content and its
    /// versioned internal name) — see DESIGN.md for this decision.
    pub causal_uid: Uid,
}

impl Call {
    pub fn new(uid: Uid, func_op: FuncOp, inputs: IndexMap<String, ValueRef>, outputs: Vec<ValueRef>) -> Self {
        Call {
            causal_uid: uid.clone(),
            uid,
            func_op,
            inputs,
            outputs,
        }
    }

    /// A call known only by its input/output UIDs, as returned by
    /// `RelAdapter::call_get_lazy`.
    pub fn lazy(uid: Uid, func_op: FuncOp, input_uids: IndexMap<String, Uid>, output_uids: Vec<Uid>) -> Self {
        let inputs = input_uids
            .into_iter()
            .map(|(name, id)| (name, ValueRef::lazy(id.clone(), id)))
            .collect();
        let outputs = output_uids
            .into_iter()
            .map(|id| ValueRef::lazy(id.clone(), id))
            .collect();
        Call::new(uid, func_op, inputs, outputs)
    }

    /// Derive a new `Call` with `inputs` replaced by fully-loaded refs,
    /// without mutating `self`.
    pub fn set_input_values(&self, inputs: IndexMap<String, ValueRef>) -> Self {
        Call {
            uid: self.uid.clone(),
            causal_uid: self.causal_uid.clone(),
            func_op: self.func_op.clone(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Derive a new `Call` with `outputs` replaced by fully-loaded refs,
    /// without mutating `self`.
    pub fn set_output_values(&self, outputs: Vec<ValueRef>) -> Self {
        Call {
            uid: self.uid.clone(),
            causal_uid: self.causal_uid.clone(),
            func_op: self.func_op.clone(),
            inputs: self.inputs.clone(),
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::signature::Signature;

    fn sig() -> Signature {
        Signature::new("add", vec!["a".into(), "b".into()], 1)
    }

    #[test]
    fn set_input_values_does_not_mutate_original() {
        let op = FuncOp::headless(sig());
        let lazy = Call::lazy(
            hash_bytes(b"call"),
            op,
            IndexMap::from([("a".to_string(), hash_bytes(b"1"))]),
            vec![hash_bytes(b"2")],
        );
        let loaded_inputs = IndexMap::from([(
            "a".to_string(),
            ValueRef::wrap(&1i64).unwrap(),
        )]);
        let populated = lazy.set_input_values(loaded_inputs.clone());
        assert!(!lazy.inputs["a"].in_memory());
        assert!(populated.inputs["a"].in_memory());
    }
}
