// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mirror engine.
//!
//! This module defines the error types used throughout the mirror engine.
//! Remote backend failures carry an [`ErrorClass`] so the connection
//! supervisor can apply the right policy (retry, reconnect, or give up).
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Backend` (Transient) | Yes | Network blips, request timeouts |
//! | `Backend` (Quorum) | Yes | Backend lost consensus, counted toward reconnect |
//! | `Backend` (NotFound) | No | Key absent, handled at call sites |
//! | `Backend` (Fatal) | No | Auth/permission failure, cluster excluded |
//! | `ClusterConnection` | Yes | Remote cluster unreachable, dial failed |
//! | `Config` | No | Configuration invalid, refuse to start |
//! | `InvalidState` | No | Registry lifecycle violation |
//! | `Shutdown` | No | Teardown in progress |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`MirrorError::is_retryable()`] to decide whether an operation should
//! be retried with backoff. Transient and Quorum failures retry forever; a
//! Quorum failure additionally feeds the per-session consecutive-error
//! counter that triggers a full reconnect at the configured threshold.

use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Classification of a remote backend failure.
///
/// Every failed backend operation maps onto exactly one class; the
/// connection supervisor's policy is keyed entirely off this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The key does not exist. Not an availability problem.
    NotFound,
    /// A transient network or request failure. Retry with backoff.
    Transient,
    /// The backend cluster could not reach consensus. Retry with backoff;
    /// consecutive occurrences trigger a full reconnect.
    Quorum,
    /// Authentication or permission failure. The cluster is excluded until
    /// its configuration changes.
    Fatal,
}

impl ErrorClass {
    /// Whether operations failing with this class should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Quorum)
    }

    /// Whether this class feeds the consecutive-quorum-error counter.
    pub fn is_quorum(&self) -> bool {
        matches!(self, Self::Quorum)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not-found",
            Self::Transient => "transient",
            Self::Quorum => "quorum",
            Self::Fatal => "fatal",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur while mirroring remote cluster state.
///
/// Per-cluster failures are contained by the supervisor and surface only as
/// a Degraded session status; only `Config` and startup failures abort.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// A remote backend operation failed.
    ///
    /// Carries the failure class the supervisor keys its policy off.
    #[error("Backend error ({cluster}/{operation}, {class}): {message}")]
    Backend {
        cluster: String,
        operation: String,
        message: String,
        class: ErrorClass,
    },

    /// Could not establish a connection to a remote cluster's backend.
    ///
    /// Retryable with exponential backoff; there is no retry limit because
    /// remote unavailability is an expected long-lived condition.
    #[error("Cluster connection error ({cluster}): {message}")]
    ClusterConnection { cluster: String, message: String },

    /// Invalid or conflicting configuration.
    ///
    /// Duplicate cluster ids, capacities outside the supported set, malformed
    /// cluster names. Not retryable: fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry lifecycle violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running registry).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Teardown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    ///
    /// Catch-all for conditions that should not happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Create a classified backend error.
    pub fn backend(
        cluster: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
        class: ErrorClass,
    ) -> Self {
        Self::Backend {
            cluster: cluster.into(),
            operation: operation.into(),
            message: message.into(),
            class,
        }
    }

    /// Create a cluster connection error.
    pub fn connection(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ClusterConnection {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    /// The failure class, if this is a classified backend error.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Backend { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { class, .. } => class.is_retryable(),
            Self::ClusterConnection { .. } => true,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
