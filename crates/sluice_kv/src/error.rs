//! Error types for the KV layer.

use thiserror::Error;

/// Result type for bucket operations.
pub type KvResult<T> = Result<T, KvError>;

/// The opaque error type update callbacks tunnel through the bucket.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in bucket operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// The key does not exist.
    #[error("key not found: {key}")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },

    /// The named view does not exist.
    #[error("view not found: {ddoc}/{view}")]
    ViewNotFound {
        /// Design document name.
        ddoc: String,
        /// View name.
        view: String,
    },

    /// An `update` callback returned an error.
    ///
    /// The boxed error is the callback's own error, passed through
    /// opaquely; callers downcast it back to their error type.
    #[error("update callback failed: {0}")]
    Callback(#[source] BoxError),

    /// A CAS update could not be applied after repeated contention.
    #[error("CAS contention on key {key} not resolved after {attempts} attempts")]
    CasContention {
        /// The contended key.
        key: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The stored value could not be interpreted by a view map function.
    #[error("view evaluation failed: {message}")]
    ViewEval {
        /// Description of the failure.
        message: String,
    },
}

impl KvError {
    /// Creates a not-found error for `key`.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Wraps a callback error for tunneling through `update`.
    pub fn callback(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Callback(Box::new(err))
    }

    /// Returns true if this error is a missing-key lookup.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
