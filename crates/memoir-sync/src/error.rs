use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] memoir_store::error::StoreError),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("remote signature conflict: {0}")]
    SignatureConflict(String),

    #[error("remote log unavailable: {0}")]
    RemoteUnavailable(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
