use thiserror::Error;

use crate::uid::Uid;

/// Errors shared across the whole workspace.
///
/// Crate-specific error kinds (`memoir_store::StoreError`,
/// `memoir_provenance::ProvenanceError`) wrap this one via `#[from]` so a
/// caller working purely at the `memoir` crate's API only ever has to match
/// on one top-level enum.
#[derive(Debug, Error)]
pub enum Error {
    /// A `ValueRef`'s payload was requested but it isn't resident in memory
    /// and no loader (cache miss + no backing store configured) could supply
    /// it.
    #[error("value {0} is not in memory and could not be loaded")]
    NotInMemory(Uid),

    /// The local signature registry observed a remote-side signature that is
    /// incompatible with the local one (type change, removed input).
    #[error("signature conflict for `{internal_name}`: {reason}")]
    SyncConflict {
        internal_name: String,
        reason: String,
    },

    /// A call or value was referenced but is absent from the relational
    /// store. Distinct from `NotInMemory`, which is about payload residency,
    /// not existence.
    #[error("schema reference missing: {0}")]
    SchemaMissing(String),

    /// The relational backend reported a transaction failure; the
    /// orchestrator has already rolled back before surfacing this.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// An input was added to a signature without a default, or a default
    /// could not be hashed.
    #[error("invalid signature change: {0}")]
    InvalidSignatureChange(String),
}

pub type Result<T> = std::result::Result<T, Error>;
