//! Crate-wide error type and result alias.

use std::io;
use thiserror::Error;

/// Convenience alias for fallible index operations.
pub type Result<T> = std::result::Result<T, UmbraError>;

/// Errors surfaced by the index layer.
///
/// `DuplicateKey`, `DuplicateEntry` and `NotFound` are expected outcomes
/// returned to the caller. `State` means an internal invariant was
/// violated and the operation aborted without attempting repair; treat it
/// as a bug or corruption, not a retryable condition.
#[derive(Debug, Error)]
pub enum UmbraError {
    /// A unique tree already contains this key.
    #[error("duplicate key: {0}")]
    DuplicateKey(i64),
    /// A non-unique tree already contains this exact (key, value) pair.
    #[error("duplicate entry: ({0}, {1})")]
    DuplicateEntry(i64, i64),
    /// The requested entry does not exist.
    #[error("entry not found")]
    NotFound,
    /// An internal invariant was violated mid-operation.
    #[error("invalid node state: {0}")]
    State(&'static str),
    /// A page image could not be decoded.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// I/O error propagated verbatim from the page store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
