//! Error types for persistent memory operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while accessing a pool.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An access fell outside the pool.
    #[error("access out of bounds: offset {offset}, len {len}, pool size {size}")]
    OutOfBounds {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: usize,
        /// The pool size.
        size: u64,
    },

    /// The pool file is already opened by another process.
    #[error("pool locked: another process has exclusive access")]
    Locked,

    /// The pool file does not have the expected size.
    #[error("pool size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        /// Size requested by the caller.
        expected: u64,
        /// Size found on disk.
        actual: u64,
    },

    /// The pool lost power (simulated) and rejects further operations.
    #[error("pool crashed: {0}")]
    Crashed(String),
}

impl StorageError {
    /// Returns true if this error is a simulated power loss.
    #[must_use]
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crashed(_))
    }
}
