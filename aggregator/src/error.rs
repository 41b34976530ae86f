//! Error types for the aggregation core

use thiserror::Error;
use trellis_shared::codec::CodecError;
use trellis_shared::HistogramError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted payload could not be decoded. Merges fail rather than
    /// silently dropping the payload's contribution.
    #[error("malformed payload: {0}")]
    Codec(#[from] CodecError),

    #[error("malformed histogram: {0}")]
    Histogram(#[from] HistogramError),

    /// A query that can never legitimately fail did (e.g. a `sum()` query
    /// returning no row).
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        StorageError::Poisoned(e.to_string())
    }
}
