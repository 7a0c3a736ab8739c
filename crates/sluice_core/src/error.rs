//! Error types for the gateway core.
//!
//! Every error maps onto the HTTP status it surfaces as, via
//! [`CoreError::status`]. The HTTP layer is an external collaborator;
//! the core only classifies.

use sluice_kv::KvError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in gateway core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input: invalid doc ID, revision ID, or principal name.
    #[error("bad request: {message}")]
    BadRequest {
        /// Description of the problem.
        message: String,
    },

    /// The anonymous principal attempted a restricted read.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Description of the restriction.
        message: String,
    },

    /// A named principal lacks channel access.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Description of the restriction.
        message: String,
    },

    /// No such document, revision, or principal.
    #[error("not found: {message}")]
    NotFound {
        /// What was missing.
        message: String,
    },

    /// Revision parent mismatch on a write.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the mismatch.
        message: String,
    },

    /// Evaluator failure or invalid evaluator output.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// A validator or mapper rejected the write with an explicit status.
    #[error("rejected ({status}): {message}")]
    Rejected {
        /// HTTP status chosen by the evaluator.
        status: u16,
        /// Rejection message.
        message: String,
    },

    /// KV store failure.
    #[error("kv store error: {0}")]
    Kv(#[from] KvError),
}

impl CoreError {
    /// Creates a bad-request (400) error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates an unauthorized (401) error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates a forbidden (403) error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Creates a not-found (404) error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a conflict (409) error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an internal (500) error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a rejection carrying an evaluator-chosen status.
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// The HTTP status this error surfaces as.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::Unauthorized { .. } => 401,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::Internal { .. } => 500,
            Self::Rejected { status, .. } => *status,
            Self::Kv(kv) if kv.is_not_found() => 404,
            Self::Kv(_) => 502,
        }
    }

    /// Returns true if this error surfaces as HTTP 404.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == 404
    }

    /// Recovers a `CoreError` that tunneled through a bucket update
    /// callback; other KV errors are wrapped as [`CoreError::Kv`].
    #[must_use]
    pub fn from_kv(err: KvError) -> Self {
        match err {
            KvError::Callback(inner) => match inner.downcast::<CoreError>() {
                Ok(core) => *core,
                Err(other) => Self::Kv(KvError::Callback(other)),
            },
            other => Self::Kv(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(CoreError::bad_request("x").status(), 400);
        assert_eq!(CoreError::unauthorized("x").status(), 401);
        assert_eq!(CoreError::forbidden("x").status(), 403);
        assert_eq!(CoreError::not_found("x").status(), 404);
        assert_eq!(CoreError::conflict("x").status(), 409);
        assert_eq!(CoreError::internal("x").status(), 500);
        assert_eq!(CoreError::rejected(422, "x").status(), 422);
    }

    #[test]
    fn kv_not_found_is_404() {
        let err = CoreError::Kv(KvError::not_found("doc1"));
        assert!(err.is_not_found());
    }

    #[test]
    fn callback_error_roundtrip() {
        let tunneled = KvError::callback(CoreError::conflict("Document exists"));
        let recovered = CoreError::from_kv(tunneled);
        assert_eq!(recovered.status(), 409);
    }
}
