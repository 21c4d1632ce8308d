//! **memoir-core** — content hashing, the value/call data model, and the
//! function signature registry underlying the memoir memoization engine.
//!
//! This crate has no notion of storage; it defines identity (`Uid`,
//! [`hash::hash_value`]), the immutable records that identity is assigned to
//! ([`ValueRef`], [`Call`], [`FuncOp`]), and the bookkeeping around a
//! function's persisted name/version/input set ([`Signature`],
//! [`SignatureRegistry`]).

pub mod call;
pub mod error;
pub mod hash;
pub mod signature;
pub mod uid;
pub mod value;

pub mod prelude {
    pub use crate::call::{Call, ComputeInputs, FuncOp};
    pub use crate::error::{Error, Result};
    pub use crate::hash::{hash_bytes, hash_canonical, hash_value, CanonicalValue, ToCanonical};
    pub use crate::signature::{RenameDirection, Signature, SignatureRegistry};
    pub use crate::uid::Uid;
    pub use crate::value::{wrap_outputs, Payload, ValueRef};
}
