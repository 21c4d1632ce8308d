use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Core(#[from] memoir_core::error::Error),

    #[error("sql backend error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("column `{0}` missing from row")]
    MissingColumn(String),

    #[error("dataframe construction failed: {0}")]
    Dataframe(String),

    #[error("arrow construction failed: {0}")]
    Arrow(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
