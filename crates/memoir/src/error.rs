use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] memoir_core::error::Error),

    #[error(transparent)]
    Store(#[from] memoir_store::error::StoreError),

    #[error(transparent)]
    Sync(#[from] memoir_sync::SyncError),

    #[error(transparent)]
    Provenance(#[from] memoir_provenance::error::ProvenanceError),

    #[error("no context is currently active")]
    NoActiveContext,

    #[error("signature out of sync: {0}")]
    SyncException(String),

    #[error("query compilation failed: {0}")]
    QueryCompilation(String),

    #[error("user function `{0}` is invalidated and cannot be called")]
    Invalidated(String),
}

pub type Result<T> = std::result::Result<T, Error>;
