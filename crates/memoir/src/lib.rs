//! **memoir** — ties the hashing/data-model (`memoir-core`), caching
//! (`memoir-cache`), relational persistence (`memoir-store`), remote sync
//! (`memoir-sync`) and provenance reconstruction (`memoir-provenance`)
//! crates together into one content-addressed memoization engine: a
//! `Storage` orchestrator plus a scoped `Context` lifecycle around it.

pub mod config;
pub mod context;
pub mod error;
pub mod storage;

/// Re-exports the surface most callers need, picking specific items from
/// each crate rather than globbing their preludes wholesale — each
/// sub-crate's prelude has its own `Result`/error type, and a glob-of-globs
/// would leave those ambiguous for anyone who in turn globs this one.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::{Context, Mode};
    pub use crate::error::{Error, Result};
    pub use crate::storage::{
        CallStruct, FuncQuery, QueryCompiler, SimpleWorkflowExecutor, Storage, ValQuery, Workflow,
    };

    pub use memoir_core::call::{Call, ComputeInputs, FuncOp};
    pub use memoir_core::hash::{hash_bytes, hash_value, CanonicalValue, ToCanonical};
    pub use memoir_core::signature::{RenameDirection, Signature, SignatureRegistry};
    pub use memoir_core::uid::Uid;
    pub use memoir_core::value::{wrap_outputs, Payload, ValueRef};

    pub use memoir_store::adapter::{Direction, ProvenanceRow, RelAdapter};
    pub use memoir_store::backend::{Record, RelationalBackend, SqliteBackend, Value};

    pub use memoir_sync::{
        apply_from_remote, bundle_to_remote, EventLogEntry, InMemoryRemoteLog, RemoteLog, RemoteSyncManager,
    };

    pub use memoir_provenance::functor::{CallNode, CallNodeId, ProvenanceFunctor, ValNode, ValNodeId};
}
