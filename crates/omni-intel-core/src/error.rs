//! Error types for omni-intel-core.
//!
//! Uses a hierarchical error enum so callers can pattern-match on the kind
//! of failure. Every error also carries an [`ErrorKind`] used to decide the
//! handler-boundary propagation policy (§7 of the specification): whether a
//! failure becomes an immediate non-retryable failure envelope, a retried
//! transient failure, a dead letter, or a partial success.

use thiserror::Error;

/// Top-level error type for all omni-intel-core operations.
#[derive(Debug, Error)]
pub enum OmniError {
    /// A required field was missing or malformed on an incoming payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// A downstream call failed in a way that is expected to be transient
    /// (network error, HTTP 503/429, timeout).
    #[error("transient downstream error: {0}")]
    Transient(String),

    /// The circuit breaker for this scope is open; the call was not made.
    #[error("circuit open for scope {scope}")]
    CircuitOpen {
        /// The breaker scope (`{handler_name}:{downstream_service}`).
        scope: String,
    },

    /// A referenced entity (project, file, chunk) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An envelope could not be decoded.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A payload exceeded the configured size cap.
    #[error("payload too large: {size} bytes exceeds cap of {cap} bytes")]
    PayloadTooLarge {
        /// Encoded payload size, in bytes.
        size: usize,
        /// Configured cap, in bytes.
        cap: usize,
    },

    /// No handler was registered for the envelope's event type.
    #[error("no handler registered for event type {0}")]
    NoHandler(String),

    /// SQLite error from the relational store adapter.
    #[error("relational store error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error from an adapter.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parsing error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Fatal internal error: programming error, serialization bug, poisoned
    /// lock. Always `retry_allowed = true` per §7, since the input itself
    /// was not the cause.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias for `Result<T, OmniError>`.
pub type OmniResult<T> = Result<T, OmniError>;

/// The error taxonomy from specification §7, used by handlers to decide how
/// to terminate an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing payload field, bad path, unknown event_type.
    Validation,
    /// 503, timeout, connection reset — retried with backoff.
    Transient,
    /// Breaker in `Open` state; no downstream touch was attempted.
    CircuitOpen,
    /// Referenced project/file/chunk absent.
    NotFound,
    /// Positional lookup succeeded but the update path disagreed; treated
    /// as `Updated` and logged, never surfaced as a hard error.
    IdempotentConflict,
    /// One of many fan-out sub-services failed; the rest succeeded.
    PartialFailure,
    /// Serialization failure, programming error.
    FatalInternal,
    /// Envelope failed to decode; no chain continuation is possible.
    Malformed,
}

impl ErrorKind {
    /// Whether the originating event should be marked `retry_allowed` on
    /// its failure envelope, per the table in specification §7.
    #[must_use]
    pub fn retry_allowed(self) -> bool {
        match self {
            ErrorKind::Validation
            | ErrorKind::NotFound
            | ErrorKind::PartialFailure
            | ErrorKind::Malformed => false,
            ErrorKind::Transient
            | ErrorKind::CircuitOpen
            | ErrorKind::IdempotentConflict
            | ErrorKind::FatalInternal => true,
        }
    }
}

impl OmniError {
    /// Classify this error into the §7 taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            OmniError::Validation(_) => ErrorKind::Validation,
            OmniError::Transient(_) | OmniError::Http(_) => ErrorKind::Transient,
            OmniError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            OmniError::NotFound(_) => ErrorKind::NotFound,
            OmniError::MalformedEnvelope(_) => ErrorKind::Malformed,
            OmniError::PayloadTooLarge { .. } => ErrorKind::Validation,
            OmniError::NoHandler(_) => ErrorKind::Malformed,
            OmniError::Database(_)
            | OmniError::Io(_)
            | OmniError::Serialization(_)
            | OmniError::Config(_)
            | OmniError::Internal(_) => ErrorKind::FatalInternal,
        }
    }

    /// Stable machine-readable error code used in failure envelope payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            OmniError::Validation(_) | OmniError::PayloadTooLarge { .. } => "INVALID_INPUT",
            OmniError::Transient(_) | OmniError::Http(_) => "TRANSIENT_ERROR",
            OmniError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            OmniError::NotFound(_) => "NOT_FOUND",
            OmniError::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            OmniError::NoHandler(_) => "NO_HANDLER",
            OmniError::Database(_)
            | OmniError::Io(_)
            | OmniError::Serialization(_)
            | OmniError::Config(_)
            | OmniError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_is_never_retry_allowed() {
        let err = OmniError::Validation("missing field".into());
        assert!(!err.kind().retry_allowed());
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn transient_is_retry_allowed() {
        let err = OmniError::Transient("503".into());
        assert!(err.kind().retry_allowed());
        assert_eq!(err.code(), "TRANSIENT_ERROR");
    }

    #[test]
    fn circuit_open_is_retry_allowed_and_never_touches_downstream() {
        let err = OmniError::CircuitOpen { scope: "indexer:vector".into() };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(err.kind().retry_allowed());
    }
}
