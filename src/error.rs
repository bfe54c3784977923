//! Error types for the engine.
//!
//! A single library-level enum so callers can pattern-match on what went
//! wrong. External-provider failures carry a `retryable` flag: the workers
//! retry those with bounded backoff, everything else is surfaced as-is.
//! Budget exhaustion never reaches this type — bounded algorithms return
//! partial results with a flag instead of erroring.

use thiserror::Error;

/// Top-level error type for all engine operations.
#[derive(Debug, Error)]
pub enum KgError {
    /// Caller input rejected: malformed parameters, missing fields,
    /// invalid ontology name.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or insufficient principal / ontology scope.
    #[error("auth error: {0}")]
    Auth(String),

    /// Referenced concept / job / ontology / document does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate content, duplicate concept id, or type-name collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// LLM, embedder, or object-store failure. `retryable` separates
    /// transient conditions (rate limits, 5xx, network) from fatal ones.
    #[error("provider error: {message} (retryable: {retryable})")]
    Provider {
        message: String,
        retryable: bool,
    },

    /// Cooperative cancellation observed mid-operation.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation detected mid-operation, e.g. an embedding whose
    /// dimension does not match the active configuration. Aborts the
    /// current operation; never crashes a worker.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl KgError {
    /// Transient provider failure, safe to retry with backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            retryable: true,
        }
    }

    /// Fatal provider failure; retrying will not help.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            retryable: false,
        }
    }

    /// True when the error may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. })
    }
}

/// Convenience alias used throughout the engine.
pub type KgResult<T> = Result<T, KgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_flag_roundtrip() {
        assert!(KgError::transient("rate limited").is_retryable());
        assert!(!KgError::fatal("bad api key").is_retryable());
        assert!(!KgError::Cancelled.is_retryable());
    }

    #[test]
    fn display_includes_kind() {
        let e = KgError::Validation("ontology name empty".into());
        assert!(e.to_string().contains("validation"));
        let e = KgError::transient("429");
        assert!(e.to_string().contains("retryable"));
    }
}
