//! Error taxonomy shared by every core module.
//!
//! Caller-facing failures fall into five kinds: validation, not-found,
//! authorization, external-service and consistency. Storage and I/O errors
//! are carried through unchanged so callers can still inspect them.

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, CanonError>;

#[derive(Debug, Error)]
pub enum CanonError {
    /// Malformed or missing input. Never retried, never widened to a broader scope.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Approval secret or verification code mismatch.
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Embedding, LLM or activity-reader failure after the retry budget was spent.
    #[error("{service} failed after {attempts} attempt(s): {message}")]
    ExternalService {
        service: &'static str,
        attempts: u32,
        message: String,
    },

    /// Illegal state transition or attempted mutation of immutable data.
    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Poisoned lock or a panicked background task.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CanonError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable snake_case label for transports and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found_error",
            Self::Authorization(_) => "authorization_error",
            Self::ExternalService { .. } => "external_service_error",
            Self::Consistency(_) => "consistency_error",
            Self::Storage(_) => "storage_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Failure reported by an external capability (embedding gateway, LLM, activity log).
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Network hiccup, timeout, rate limit. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
