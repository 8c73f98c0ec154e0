//! Error types for PMObj core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in unified log operations.
///
/// A torn or stale entry is *not* an error: it ends iteration and is
/// handled locally. Errors are reserved for allocator failures, misuse and
/// corruption that no recovery step can interpret.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Pool access failed.
    #[error("storage error: {0}")]
    Storage(#[from] pmobj_storage::StorageError),

    /// The log contents cannot be interpreted safely.
    ///
    /// This is fatal: the pool must not be used after it is reported.
    #[error("log corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// The allocator could not supply a continuation segment.
    #[error("log extension failed: {message}")]
    ExtendFailed {
        /// Description of the failure.
        message: String,
    },

    /// An entry does not fit in the reserved capacity.
    #[error("log full: entry needs {needed} bytes, {available} available")]
    LogFull {
        /// Bytes the entry requires.
        needed: usize,
        /// Bytes left in the log.
        available: usize,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// An argument is out of range.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an extension failure.
    pub fn extend_failed(message: impl Into<String>) -> Self {
        Self::ExtendFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true if the error means the pool can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmobj_storage::StorageError;

    #[test]
    fn corruption_is_fatal() {
        assert!(CoreError::corruption("bad tag").is_fatal());
        assert!(!CoreError::extend_failed("oom").is_fatal());
    }

    #[test]
    fn storage_error_converts() {
        let err: CoreError = StorageError::Crashed("power loss".into()).into();
        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(err.to_string(), "storage error: pool crashed: power loss");
    }

    #[test]
    fn log_full_message() {
        let err = CoreError::LogFull {
            needed: 128,
            available: 64,
        };
        assert_eq!(err.to_string(), "log full: entry needs 128 bytes, 64 available");
    }
}
