// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are split by where they come from. [`RemoteError`] is what a
//! [`RemoteClient`](crate::remote::RemoteClient) hands back for a single call;
//! [`ReplicationError`] is the crate-wide error, carrying the operation that
//! failed so a run summary can say what went wrong.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `Config` | No | Yes | Malformed time expression, bad regex, conflicting settings |
//! | `Authentication` | No | Yes | Credentials rejected by either project |
//! | `Throttled` | Yes | No | Remote service asked us to slow down |
//! | `Transport` | Yes | No | Network failure or per-call timeout |
//! | `Rejected` | No | No | Remote refused the request (validation, duplicates) |
//! | `UnresolvedReference` | No | No | Parent never mapped after the retry pass |
//! | `Transformation` | No | No | Value transformation failed for one datapoint |
//! | `MappingConflict` | No | Yes | Destination identity changed for a mapped external id |
//! | `InvalidState` | No | Yes | Orchestrator used out of order |
//! | `Internal` | No | No | Unexpected internal error (e.g. a worker task panicked) |
//!
//! Only fatal errors terminate a run. Everything else is absorbed into the
//! [`RunSummary`](crate::summary::RunSummary).

use std::time::Duration;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Failure of a single call against the remote data-platform API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Credentials were rejected. Aborts the run.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The service is rate limiting us. `retry_after` is the server's hint, if any.
    #[error("throttled by remote service")]
    Throttled { retry_after: Option<Duration> },

    /// Network-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not complete within `client_timeout`.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The request was understood and refused. Retrying will not help.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Check if the call should be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::Transport(_) | Self::Timeout(_)
        )
    }

    /// Throttling gets exponential backoff instead of the plain transport delay.
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// Authentication failures abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    /// Invalid configuration. Raised before any remote call is made.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credentials rejected by the remote service.
    #[error("Authentication error ({operation}): {message}")]
    Authentication { operation: String, message: String },

    /// Still throttled after the bounded number of attempts.
    #[error("Throttled ({operation}) after {attempts} attempts")]
    Throttled { operation: String, attempts: usize },

    /// Network failure or timeout after the bounded number of attempts.
    #[error("Transport error ({operation}): {message}")]
    Transport { operation: String, message: String },

    /// Remote refused the request.
    #[error("Rejected ({operation}): {message}")]
    Rejected { operation: String, message: String },

    /// Parent reference could not be mapped into the destination.
    #[error("Unresolved reference: {external_id} -> parent {parent_external_id}")]
    UnresolvedReference {
        external_id: String,
        parent_external_id: String,
    },

    /// Value transformation failed for one datapoint.
    #[error("Transformation error ({external_id} @ {timestamp}): {message}")]
    Transformation {
        external_id: String,
        timestamp: i64,
        message: String,
    },

    /// An external id was re-recorded with a different destination identity.
    #[error("Mapping conflict for {resource}/{external_id}: mapped to {existing}, got {attempted}")]
    MappingConflict {
        resource: String,
        external_id: String,
        existing: i64,
        attempted: i64,
    },

    /// Orchestrator state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Wrap a remote failure with the operation it happened in.
    pub fn remote(operation: impl Into<String>, source: RemoteError) -> Self {
        let operation = operation.into();
        match source {
            RemoteError::Authentication(message) => Self::Authentication { operation, message },
            RemoteError::Throttled { .. } => Self::Throttled {
                operation,
                attempts: 1,
            },
            RemoteError::Transport(message) => Self::Transport { operation, message },
            RemoteError::Timeout(after) => Self::Transport {
                operation,
                message: format!("timed out after {after:?}"),
            },
            RemoteError::Rejected(message) => Self::Rejected { operation, message },
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled { .. } => true,
            Self::Transport { .. } => true,
            Self::Config(_) => false,
            Self::Authentication { .. } => false,
            Self::Rejected { .. } => false,
            Self::UnresolvedReference { .. } => false,
            Self::Transformation { .. } => false,
            Self::MappingConflict { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Authentication { .. }
                | Self::MappingConflict { .. }
                | Self::InvalidState { .. }
        )
    }
}

impl From<regex::Error> for ReplicationError {
    fn from(e: regex::Error) -> Self {
        Self::Config(format!("invalid exclude pattern: {e}"))
    }
}
