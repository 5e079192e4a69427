//! Storage error types.

use thiserror::Error;

/// Errors raised by a [`CryptoStore`](super::CryptoStore) implementation.
///
/// Storage failures are always propagated to the caller. Bulk operations that
/// hit one stop at that item; items already written stay written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Stored record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying storage engine failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Record exists but violates a store invariant
    #[error("corrupted record: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
