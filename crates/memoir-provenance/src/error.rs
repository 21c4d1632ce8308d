use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error(transparent)]
    Store(#[from] memoir_store::error::StoreError),

    #[error("column `{0}` not found")]
    UnknownColumn(String),

    #[error("`{0}` already in use")]
    NameCollision(String),

    #[error("mask length {got} does not match row count {expected}")]
    InvalidIndexer { got: usize, expected: usize },

    #[error("ambiguous provenance for column `{col}`: {reason}")]
    ProvenanceAmbiguity { col: String, reason: String },

    #[error("dataframe construction failed: {0}")]
    Dataframe(String),

    #[error("payload decoding failed: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ProvenanceError>;
