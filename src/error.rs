//! Error types for contactlink.
//!
//! All errors are strongly typed using thiserror. Every error maps onto one of
//! three kinds (see [`ErrorKind`]) so the boundary layer can translate it into
//! a transport-specific signal without inspecting messages.

use thiserror::Error;

use crate::contact::ContactId;
use crate::storage::StorageError;

/// Validation errors raised at the request boundary, before any store access.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Provide email or phoneNumber")]
    EmptyIdentity,

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while running an identify request.
///
/// All of these are transient: no partial state survives them, so the caller
/// may retry the whole request.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Unit of work aborted after {attempts} conflicting attempts")]
    RetriesExhausted {
        attempts: usize,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Execution queue is full on {path} (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Execution worker disconnected on {path}")]
    Disconnected {
        path: String,
    },
}

/// Integrity violations. These signal a bug or corrupted data, never a
/// recoverable condition.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Contact {id} links to missing contact {linked_id}")]
    DanglingLink {
        id: ContactId,
        linked_id: ContactId,
    },

    #[error("Contact {id} links to {linked_id}, expected canonical primary {primary_id}")]
    NonCanonicalLink {
        id: ContactId,
        linked_id: ContactId,
        primary_id: ContactId,
    },

    #[error("Component has {count} primaries after reconciliation")]
    MultiplePrimaries {
        count: usize,
    },

    #[error("Component of {members} contacts has no primary")]
    MissingPrimary {
        members: usize,
    },

    #[error("Contact {id} is secondary but has no linked id")]
    UnlinkedSecondary {
        id: ContactId,
    },
}

/// Coarse classification used by boundary layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request itself is malformed; do not retry.
    InvalidRequest,
    /// The store or the execution layer failed transiently; safe to retry.
    TransientStoreFailure,
    /// Stored state is inconsistent; fatal for the request.
    IntegrityViolation,
}

/// Top-level error type for contactlink.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Integrity violation: {0}")]
    Integrity(#[from] IntegrityError),
}

impl From<StorageError> for LinkError {
    fn from(err: StorageError) -> Self {
        Self::Execution(ExecutionError::Storage(err))
    }
}

impl LinkError {
    /// Returns the coarse kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::InvalidRequest,
            Self::Execution(_) => ErrorKind::TransientStoreFailure,
            Self::Integrity(_) => ErrorKind::IntegrityViolation,
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an integrity violation.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    /// Returns true if this error was caused by a store conflict that
    /// the caller may resolve by re-running the unit of work.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Execution(ExecutionError::Storage(StorageError::Conflict { .. }))
        )
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientStoreFailure)
    }
}

/// Result type alias for contactlink operations.
pub type LinkResult<T> = Result<T, LinkError>;
