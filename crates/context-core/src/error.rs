//! Error types shared by the memory and session stores.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No row matches the supplied id.
    #[error("not found")]
    NotFound,

    /// Session id collision on create.
    #[error("session already exists")]
    SessionExists,

    /// A single entry's estimated tokens exceed the session budget.
    #[error("single entry exceeds token budget")]
    OverBudget,

    /// Recall was called with neither query text nor query embedding.
    #[error("query text is empty")]
    InvalidQuery,

    /// The store handle was released by `close()`.
    #[error("store is closed")]
    StoreClosed,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Substrate-level I/O and constraint errors.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Connection pool errors.
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Metadata (de)serialization errors.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
