//! Read-only functor over persisted provenance: reconstructs a queryable
//! subgraph of values and calls without touching the relational store's
//! write path (spec §4.I).

pub mod error;
pub mod functor;

pub mod prelude {
    pub use crate::error::{ProvenanceError, Result};
    pub use crate::functor::{CallNode, CallNodeId, ProvenanceFunctor, ValNode, ValNodeId};
}
