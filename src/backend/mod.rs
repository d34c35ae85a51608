// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend abstraction: the capability surface a remote cluster's key-value
//! store must provide.
//!
//! Everything above this module (sessions, the supervisor, the mirror
//! engine) is written against [`KvBackend`] and never against a concrete
//! store. Two implementations ship here:
//!
//! - [`memory::MemoryBackend`]: in-process store with revision history,
//!   cursor-based watch resume, and lease expiry. Used in tests and as the
//!   reference for the trait's semantics.
//! - [`redis::RedisBackend`]: adapter over a Redis instance using keyspace
//!   notifications. Has no positional history, so every watch interruption
//!   reports [`BackendError::ResyncRequired`].
//!
//! # Error contract
//!
//! Implementations classify every failure as one of the [`BackendError`]
//! variants. The supervisor's behavior is keyed entirely off this
//! classification:
//!
//! - `Transient`: retry the operation, connection stays up.
//! - `Quorum`: counts toward the consecutive-quorum-error threshold; the
//!   data read may be stale.
//! - `Auth` / `Fatal`: the session degrades permanently until reconfigured.
//! - `ResyncRequired`: not a failure. The watch lost its position and the
//!   caller must take a fresh snapshot.

pub mod memory;
pub mod redis;

use crate::error::ErrorClass;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Boxed future alias used by the object-safe backend traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error classification
// ═══════════════════════════════════════════════════════════════════════════════

/// A classified failure from a backend operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Transient network or request failure. Safe to retry on the same
    /// connection.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// The backend answered but could not reach quorum. Data may be stale.
    #[error("backend lost quorum: {0}")]
    Quorum(String),

    /// The backend rejected this client's credentials.
    #[error("backend rejected credentials: {0}")]
    Auth(String),

    /// The watch position is gone and cannot be resumed. The caller must
    /// take a fresh snapshot. This is a signal, not a failure.
    #[error("watch position lost, full resync required: {0}")]
    ResyncRequired(String),

    /// Unrecoverable failure. The session degrades permanently.
    #[error("fatal backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    /// Map to the coarse failure class the supervisor keys off.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Transient(_) => ErrorClass::Transient,
            Self::Quorum(_) => ErrorClass::Quorum,
            // Resync is handled before classification; if it leaks through,
            // treating it as transient keeps the session retrying.
            Self::ResyncRequired(_) => ErrorClass::Transient,
            Self::Auth(_) | Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_resync_required(&self) -> bool {
        matches!(self, Self::ResyncRequired(_))
    }

    pub fn is_quorum(&self) -> bool {
        matches!(self, Self::Quorum(_))
    }

    /// Whether the session must stop retrying and degrade permanently.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Fatal(_))
    }

    /// Lift into a [`crate::MirrorError`] with cluster and operation context.
    pub fn into_mirror(self, cluster: &str, operation: &str) -> crate::MirrorError {
        let class = self.class();
        crate::MirrorError::backend(cluster, operation, self.to_string(), class)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Data types: pairs, snapshots, watch events, leases
// ═══════════════════════════════════════════════════════════════════════════════

/// A key and its value as stored in a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A point-in-time listing of every key under a prefix.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub pairs: Vec<KvPair>,

    /// Watch position that captures this snapshot's state, if the backend
    /// has positional history. Passing it to [`KvBackend::watch`] yields
    /// exactly the changes made after the snapshot.
    pub cursor: Option<String>,
}

/// A single change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub kind: KvEventKind,

    /// Resume position after this event, if the backend supports cursors.
    /// Callers persist the latest value to resume across reconnects.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEventKind {
    Upsert { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl KvEventKind {
    pub fn key(&self) -> &str {
        match self {
            Self::Upsert { key, .. } => key,
            Self::Delete { key } => key,
        }
    }
}

/// A live watch over a key prefix.
///
/// Events arrive in the order the backend observed them. An `Err` item
/// reports why the watch ended; afterwards the channel closes. A close
/// without a preceding error means the connection went away and the caller
/// decides between resume and resync based on [`Self::resumable`].
pub struct WatchSubscription {
    resumable: bool,
    events: mpsc::Receiver<BackendResult<KvEvent>>,
}

impl WatchSubscription {
    pub fn new(resumable: bool, events: mpsc::Receiver<BackendResult<KvEvent>>) -> Self {
        Self { resumable, events }
    }

    /// Whether this subscription can resume from a cursor after an
    /// interruption. When false, every interruption forces a full resync.
    pub fn resumable(&self) -> bool {
        self.resumable
    }

    /// Receive the next event. `None` means the watch has ended.
    pub async fn recv(&mut self) -> Option<BackendResult<KvEvent>> {
        self.events.recv().await
    }

    /// Stop receiving. Remaining buffered events are dropped.
    pub fn close(&mut self) {
        self.events.close();
    }
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("resumable", &self.resumable)
            .finish_non_exhaustive()
    }
}

/// Handle to a leased key. Keys written with a lease disappear when the
/// lease stops being renewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    /// Backend-assigned lease id.
    pub id: String,
    /// The key the lease is attached to.
    pub key: String,
    /// The TTL granted at creation; each renewal restores it in full.
    pub ttl: Duration,
}

// ═══════════════════════════════════════════════════════════════════════════════
// The capability traits
// ═══════════════════════════════════════════════════════════════════════════════

/// The operations the mirror engine needs from a remote cluster's store.
///
/// All methods are object-safe so sessions can hold `Arc<dyn KvBackend>`
/// regardless of the concrete store behind a cluster address.
pub trait KvBackend: Send + Sync {
    /// Read one key. Missing keys are [`BackendError::NotFound`].
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Vec<u8>>;

    /// Write one key, unconditionally.
    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ()>;

    /// Delete one key. Deleting a missing key succeeds.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()>;

    /// List every key under `prefix` at one point in time.
    fn snapshot<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Snapshot>;

    /// Watch changes under `prefix`.
    ///
    /// With `cursor: None` the watch starts at the backend's current state.
    /// With a cursor from a previous snapshot or event, the backend replays
    /// every change after that position; if the position has been
    /// compacted away the call fails with [`BackendError::ResyncRequired`].
    fn watch<'a>(
        &'a self,
        prefix: &'a str,
        cursor: Option<String>,
    ) -> BoxFuture<'a, WatchSubscription>;

    /// Write a key bound to a new lease with the given TTL.
    fn put_with_lease<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, LeaseHandle>;

    /// Extend a lease back to its full TTL. Fails with
    /// [`BackendError::NotFound`] once the lease has already expired.
    fn renew_lease<'a>(&'a self, lease: &'a LeaseHandle) -> BoxFuture<'a, ()>;

    /// Release the connection. Idempotent; pending watches end.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Factory turning a cluster address into a live backend connection.
///
/// The registry is generic over this seam: production wires the Redis
/// connector, tests wire scripted in-memory connectors to drive failure
/// scenarios without a network.
pub trait BackendConnector: Send + Sync {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Arc<dyn KvBackend>>;
}
