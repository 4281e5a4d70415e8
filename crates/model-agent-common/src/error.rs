//! Error types for the model agent
//!
//! Two layers of errors exist:
//! - [`StoreError`] is what the ConfigMap store adapter reports. Callers
//!   dispatch on `NotFound`, `Conflict` and `AlreadyExists`.
//! - [`Error`] is what reconciler operations return to their callers.
//!   Conflicts are handled by the retry coordinator and only surface as
//!   [`Error::VersionExhausted`] once the budget is spent.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Errors reported by the remote record store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The named record does not exist
    #[error("record {name} not found")]
    NotFound {
        /// Name of the record that was requested
        name: String,
    },

    /// The record changed since it was read (resourceVersion mismatch)
    #[error("version conflict on record {name}: {message}")]
    Conflict {
        /// Name of the record being written
        name: String,
        /// Message returned by the API server
        message: String,
    },

    /// A create raced with another writer that created the record first
    #[error("record {name} already exists")]
    AlreadyExists {
        /// Name of the record being created
        name: String,
    },

    /// Network or server failure
    #[error("transport error on record {name}: {message}")]
    Transport {
        /// Name of the record the call was for
        name: String,
        /// Description of what failed
        message: String,
    },
}

impl StoreError {
    /// Create a transport error for the given record
    pub fn transport(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error for the given record
    pub fn conflict(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// True if the record was absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if the write lost an optimistic-concurrency race.
    ///
    /// A create that loses to a concurrent create is a conflict too: re-reading
    /// and applying the change as an update resolves both.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }
}

/// Main error type for model state operations
#[derive(Debug, Error)]
pub enum Error {
    /// Neither a namespaced nor a cluster-scoped model was identified
    #[error("invalid model reference: {message}")]
    InvalidRef {
        /// Description of what's invalid
        message: String,
    },

    /// The store failed for a reason other than a version conflict
    #[error("store unavailable [{context}]: {source}")]
    StoreUnavailable {
        /// Operation that was talking to the store
        context: String,
        /// The underlying store error
        #[source]
        source: StoreError,
    },

    /// A write lost a version race; handled inside the retry coordinator
    #[error("version conflict [{context}]: {source}")]
    Conflict {
        /// Operation that was writing
        context: String,
        /// The underlying store error
        #[source]
        source: StoreError,
    },

    /// Every attempt allowed by the conflict budget lost a version race
    #[error("version conflicts exhausted [{context}] after {attempts} attempts")]
    VersionExhausted {
        /// Operation that was writing
        context: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// An entry could not be serialized
    #[error("encoding failure for {key}: {message}")]
    EncodingFailure {
        /// Model key of the entry
        key: String,
        /// Description of what failed
        message: String,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled [{context}]")]
    Cancelled {
        /// Operation that was cancelled
        context: String,
    },

    /// Something the caller asked for does not exist
    #[error("not found [{context}]: {message}")]
    Missing {
        /// Operation that performed the lookup
        context: String,
        /// Description of what is missing
        message: String,
    },
}

impl Error {
    /// Create an invalid-reference error
    pub fn invalid_ref(msg: impl Into<String>) -> Self {
        Self::InvalidRef {
            message: msg.into(),
        }
    }

    /// Classify a store error raised while running `context`.
    ///
    /// Conflicts stay retryable by the conflict coordinator; everything else is
    /// reported as the store being unavailable.
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        let context = context.into();
        if source.is_conflict() {
            Self::Conflict { context, source }
        } else {
            Self::StoreUnavailable { context, source }
        }
    }

    /// Create an encoding error for the entry at `key`
    pub fn encoding(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::EncodingFailure {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a cancellation error without specific context
    pub fn cancelled_unknown() -> Self {
        Self::cancelled(UNKNOWN_CONTEXT)
    }

    /// Create a not-found error for a lookup
    pub fn missing(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Missing {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// True if this is a version conflict the coordinator should retry
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True if the caller cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if this error is transient and the operation may succeed if retried
    ///
    /// Only transport failures are transient. Conflicts are retried by the
    /// conflict coordinator, not by transient retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable {
                source: StoreError::Transport { .. },
                ..
            }
        )
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Self::StoreUnavailable { context, .. }
            | Self::Conflict { context, .. }
            | Self::VersionExhausted { context, .. }
            | Self::Cancelled { context }
            | Self::Missing { context, .. } => Some(context),
            Self::InvalidRef { .. } | Self::EncodingFailure { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a lost create race is treated like a resourceVersion conflict
    ///
    /// Two writers see no record and both try to create it. The loser must
    /// re-read and update instead of failing the caller.
    #[test]
    fn story_create_race_is_a_conflict() {
        let lost = StoreError::AlreadyExists {
            name: "node-a".to_string(),
        };
        assert!(lost.is_conflict());
        assert!(Error::store("set_status", lost).is_conflict());

        let stale = StoreError::conflict("node-a", "the object has been modified");
        assert!(Error::store("set_status", stale).is_conflict());
    }

    #[test]
    fn transport_failures_are_store_unavailable_and_retryable() {
        let err = Error::store("delete", StoreError::transport("node-a", "connection reset"));
        assert!(matches!(err, Error::StoreUnavailable { .. }));
        assert!(err.is_retryable());
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(err.context(), Some("delete"));
    }

    #[test]
    fn unexpected_not_found_is_not_retryable() {
        let err = Error::store(
            "restore",
            StoreError::NotFound {
                name: "node-a".to_string(),
            },
        );
        assert!(matches!(err, Error::StoreUnavailable { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn caller_errors_are_not_retryable() {
        assert!(!Error::invalid_ref("empty model name").is_retryable());
        assert!(!Error::encoding("default.basemodel.m", "bad float").is_retryable());
        assert!(!Error::cancelled("set_progress").is_retryable());
        assert!(Error::cancelled_unknown().is_cancelled());
        assert_eq!(Error::cancelled_unknown().context(), Some(UNKNOWN_CONTEXT));
    }

    #[test]
    fn exhausted_budget_reports_attempts() {
        let err = Error::VersionExhausted {
            context: "set_status".to_string(),
            attempts: 4,
        };
        assert!(err.to_string().contains("after 4 attempts"));
        assert!(!err.is_conflict());
    }
}
