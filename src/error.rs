//! Controller error types.
//!
//! All failures in `liblvc` are represented by the [`LvcError`] enum, which
//! derives [`thiserror::Error`].  The engine never lets one of these unwind
//! past the dispatcher: every error is classified (transient, permanent,
//! conflict, fatal) and converted into a requeue decision plus a status
//! write.

use thiserror::Error;

/// Unified error type for store and backend operations.
#[derive(Debug, Error, Clone)]
pub enum LvcError {
    /// The record was not found in the store.  Benign: the volume was
    /// already cleaned up.
    #[error("record {0} not found")]
    RecordNotFound(String),

    /// The physical volume was not found where an operation assumed
    /// presence.  Benign: short-circuits to the creation or cleanup path.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// Optimistic-concurrency mismatch: the record changed since it was
    /// read.  Never surfaced to status; the caller re-reads and retries.
    #[error("version conflict on record {0}")]
    Conflict(String),

    /// A backend call exceeded its deadline.  Transient.
    #[error("{op} timed out for volume {volume}")]
    Timeout {
        /// Operation that was cut off, e.g. `"create"`.
        op: &'static str,
        /// Volume the operation targeted.
        volume: String,
    },

    /// The backend is temporarily busy or unreachable.  Transient.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The request can never succeed as stated (zero size, shrink attempt,
    /// corrupt backend state).  Recorded in status and retried on the same
    /// schedule so that a corrected spec is picked up, but distinguishable
    /// from transient failures for operators.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A programming invariant was violated (e.g. a record with an empty
    /// identity field).  Halts reconciliation of that key only.
    #[error("invariant violated: {0}")]
    Fatal(String),

    /// An unclassified internal error.  Treated as transient.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LvcError {
    /// Create an [`LvcError::Unavailable`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn unavailable<E: std::fmt::Display>(e: E) -> Self {
        Self::Unavailable(e.to_string())
    }

    /// Create an [`LvcError::Invalid`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid<E: std::fmt::Display>(e: E) -> Self {
        Self::Invalid(e.to_string())
    }

    /// Create an [`LvcError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Whether a retry without any input change can be expected to succeed
    /// eventually.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable(_) | Self::Internal(_)
        )
    }

    /// Whether this error must stop reconciliation of the affected key.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = LvcError::VolumeNotFound("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");

        let err = LvcError::Timeout {
            op: "resize",
            volume: "vol-9".into(),
        };
        assert_eq!(err.to_string(), "resize timed out for volume vol-9");
    }

    #[test]
    fn transient_classification() {
        assert!(
            LvcError::Timeout {
                op: "create",
                volume: "v".into()
            }
            .is_transient()
        );
        assert!(LvcError::Unavailable("vg locked".into()).is_transient());
        assert!(!LvcError::Invalid("shrink".into()).is_transient());
        assert!(!LvcError::Conflict("v".into()).is_transient());
        assert!(!LvcError::Fatal("no node".into()).is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(LvcError::Fatal("empty name".into()).is_fatal());
        assert!(!LvcError::Invalid("bad size".into()).is_fatal());
    }
}
