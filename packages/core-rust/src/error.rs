//! Error types surfaced by every state operation.
//!
//! [`StateError`] is the single error type returned by both the blocking and
//! the future-returning forms of an operation, so no information is lost
//! crossing the sync/async boundary. Absence of a key is not an error.

use std::fmt;

/// Whether a failed mutation may have been applied at the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation definitely had no effect (rejected before or by the backend).
    NotApplied,
    /// The operation may or may not have been applied. The caller decides
    /// whether to retry.
    Unknown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotApplied => f.write_str("not applied"),
            Self::Unknown => f.write_str("outcome unknown"),
        }
    }
}

/// Field-less discriminant of [`StateError`], convenient for matching and
/// for metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unsupported,
    InvalidArgument,
    CounterTypeConflict,
    BackendUnavailable,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    /// Stable lowercase name, used as a metrics label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsupported => "unsupported",
            Self::InvalidArgument => "invalid_argument",
            Self::CounterTypeConflict => "counter_type_conflict",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors returned by state store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// The hosting context has no state backend configured, or the backend
    /// lacks the requested capability.
    #[error("state is not supported: {reason}")]
    Unsupported { reason: String },

    /// Oversized value, malformed key, or otherwise unusable input.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The bytes stored under a key are not an 8-byte counter.
    #[error("value of {len} bytes cannot be read as a counter")]
    CounterTypeConflict { len: usize },

    /// Connectivity or backend-side failure.
    #[error("state backend unavailable ({outcome}): {reason}")]
    BackendUnavailable { reason: String, outcome: Outcome },

    /// A deadline elapsed before the operation completed.
    #[error("operation timed out after {timeout_ms}ms ({outcome})")]
    Timeout { timeout_ms: u64, outcome: Outcome },

    /// The operation was cancelled by the caller or by store teardown.
    #[error("operation cancelled")]
    Cancelled,
}

impl StateError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::CounterTypeConflict { .. } => ErrorKind::CounterTypeConflict,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// The outcome carried by unavailable/timeout errors. Every other error
    /// is raised before anything reaches the backend.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::BackendUnavailable { outcome, .. } | Self::Timeout { outcome, .. } => *outcome,
            _ => Outcome::NotApplied,
        }
    }

    /// Replaces the outcome of unavailable/timeout errors; other errors are
    /// returned unchanged.
    #[must_use]
    pub fn with_outcome(self, outcome: Outcome) -> Self {
        match self {
            Self::BackendUnavailable { reason, .. } => Self::BackendUnavailable { reason, outcome },
            Self::Timeout { timeout_ms, .. } => Self::Timeout {
                timeout_ms,
                outcome,
            },
            other => other,
        }
    }

    /// Transient failures that a retry might resolve.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(StateError::unsupported("x").kind(), ErrorKind::Unsupported);
        assert_eq!(StateError::invalid("x").kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            StateError::CounterTypeConflict { len: 3 }.kind(),
            ErrorKind::CounterTypeConflict
        );
        assert_eq!(StateError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn with_outcome_only_touches_backend_errors() {
        let err = StateError::Timeout {
            timeout_ms: 10,
            outcome: Outcome::NotApplied,
        }
        .with_outcome(Outcome::Unknown);
        assert_eq!(err.outcome(), Outcome::Unknown);

        let err = StateError::Cancelled.with_outcome(Outcome::Unknown);
        assert_eq!(err, StateError::Cancelled);
        assert_eq!(err.outcome(), Outcome::NotApplied);
    }

    #[test]
    fn display_includes_outcome() {
        let err = StateError::BackendUnavailable {
            reason: "connection refused".to_string(),
            outcome: Outcome::Unknown,
        };
        assert_eq!(
            err.to_string(),
            "state backend unavailable (outcome unknown): connection refused"
        );
    }

    #[test]
    fn only_backend_failures_are_transient() {
        assert!(StateError::Timeout {
            timeout_ms: 1,
            outcome: Outcome::Unknown
        }
        .is_transient());
        assert!(!StateError::CounterTypeConflict { len: 0 }.is_transient());
        assert!(!StateError::Cancelled.is_transient());
    }
}
