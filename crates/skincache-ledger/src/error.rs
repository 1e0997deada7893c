//! Error types for skincache-ledger

use thiserror::Error;

/// Errors that can occur while persisting the freshness ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The ledger map could not be encoded
    #[error("Ledger encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    /// The ledger file could not be written or renamed into place
    #[error("Ledger persist failed for {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Ledger path has no parent directory to stage the temp file in
    #[error("Ledger path has no parent directory: {0}")]
    InvalidPath(String),
}

/// Result type for ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
