// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-cluster session state: connection handle, lifecycle status, sync
//! cursor, and the consecutive-quorum-error counter.
//!
//! A session is driven by exactly one supervisor task (see
//! `registry::session_task`); this module holds the state that task and
//! outside observers share.
//!
//! # Lifecycle
//!
//! ```text
//!             ┌────────────┐
//!   Open ───► │ Connecting │ ◄──────────────┐
//!             └─────┬──────┘                │ reconnect
//!                   │ connected             │ (backoff + jitter)
//!             ┌─────▼──────┐          ┌─────┴─────┐
//!             │  Syncing   │ ───────► │ Degraded  │
//!             └─────┬──────┘  failure └─────┬─────┘
//!                   │ snapshot replayed     │ fatal error:
//!             ┌─────▼──────┐                │ permanent
//!             │   Ready    │ ──────────────►│
//!             └─────┬──────┘  failure
//!                   │ Close()
//!             ┌─────▼──────┐
//!             │   Closed   │  (terminal)
//!             └────────────┘
//! ```
//!
//! `Close()` is idempotent and reachable from every state. `Degraded` is
//! permanent only after a fatal (configuration or authentication) error;
//! otherwise the supervisor keeps reconnecting forever.

use crate::backend::KvBackend;
use crate::config::RemoteClusterConfig;
use crate::partition::IdentityPartition;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Establishing (or re-establishing) the backend connection.
    Connecting,
    /// Connected; replaying the snapshot into the mirror.
    Syncing,
    /// Initial sync done; streaming watch events.
    Ready,
    /// Not serving updates. Transient unless a fatal error latched it.
    Degraded,
    /// Torn down. Terminal.
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Syncing => "syncing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Shared state for one remote cluster's mirroring session.
pub struct RemoteClusterSession {
    config: RemoteClusterConfig,
    partition: IdentityPartition,
    quorum_threshold: u32,

    status_tx: watch::Sender<SessionStatus>,
    backend: RwLock<Option<Arc<dyn KvBackend>>>,

    /// Consecutive quorum failures on the current connection.
    quorum_errors: AtomicU32,
    /// Watch position to resume from after a disconnect.
    cursor: Mutex<Option<String>>,
    /// Whether the backend's watches can resume from a cursor at all.
    resumable: AtomicBool,

    permanently_degraded: AtomicBool,
    closed: AtomicBool,
    events_applied: AtomicU64,
}

impl RemoteClusterSession {
    pub fn new(
        config: RemoteClusterConfig,
        partition: IdentityPartition,
        quorum_threshold: u32,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Connecting);
        Self {
            config,
            partition,
            quorum_threshold,
            status_tx,
            backend: RwLock::new(None),
            quorum_errors: AtomicU32::new(0),
            cursor: Mutex::new(None),
            resumable: AtomicBool::new(false),
            permanently_degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events_applied: AtomicU64::new(0),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.name
    }

    pub fn cluster_id(&self) -> u32 {
        self.config.cluster_id
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn partition(&self) -> &IdentityPartition {
        &self.partition
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Observe status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Move to a new status. Transitions out of `Closed` are ignored.
    pub fn set_status(&self, status: SessionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == SessionStatus::Closed && status != SessionStatus::Closed {
                warn!(
                    cluster = %self.config.name,
                    attempted = %status,
                    "ignoring status change on closed session"
                );
                return false;
            }
            if *current == status {
                return false;
            }
            info!(
                cluster = %self.config.name,
                from = %current,
                to = %status,
                "session status change"
            );
            *current = status;
            true
        });
    }

    /// Latch the session into permanent degradation. The supervisor stops
    /// reconnecting; only a configuration change can revive the cluster.
    pub fn mark_permanently_degraded(&self, reason: &str) {
        if !self.permanently_degraded.swap(true, Ordering::AcqRel) {
            warn!(
                cluster = %self.config.name,
                reason,
                "session permanently degraded"
            );
        }
        self.set_status(SessionStatus::Degraded);
    }

    pub fn is_permanently_degraded(&self) -> bool {
        self.permanently_degraded.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Quorum error accounting
    // ─────────────────────────────────────────────────────────────────────────

    /// Record one quorum failure. Returns `true` exactly when this failure
    /// crosses the configured threshold; the caller then tears down and
    /// replaces the connection. Further failures on the same connection do
    /// not re-trigger.
    pub fn record_quorum_error(&self) -> bool {
        let count = self.quorum_errors.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            cluster = %self.config.name,
            consecutive = count,
            threshold = self.quorum_threshold,
            "quorum error"
        );
        count == self.quorum_threshold
    }

    /// A successful operation proves the backend answers with quorum again.
    pub fn record_quorum_success(&self) {
        self.quorum_errors.store(0, Ordering::SeqCst);
    }

    pub fn quorum_error_count(&self) -> u32 {
        self.quorum_errors.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection handle
    // ─────────────────────────────────────────────────────────────────────────

    /// Install a fresh connection, replacing any previous one. The quorum
    /// counter restarts with the new connection.
    pub async fn install_backend(&self, backend: Arc<dyn KvBackend>) {
        let previous = {
            let mut guard = self.backend.write().await;
            guard.replace(backend)
        };
        self.quorum_errors.store(0, Ordering::SeqCst);
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!(cluster = %self.config.name, "closing replaced connection: {e}");
            }
        }
    }

    pub async fn current_backend(&self) -> Option<Arc<dyn KvBackend>> {
        self.backend.read().await.clone()
    }

    /// Remove and return the current connection without closing it.
    pub async fn take_backend(&self) -> Option<Arc<dyn KvBackend>> {
        self.backend.write().await.take()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync cursor
    // ─────────────────────────────────────────────────────────────────────────

    pub fn cursor(&self) -> Option<String> {
        match self.cursor.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_cursor(&self, cursor: Option<String>) {
        match self.cursor.lock() {
            Ok(mut guard) => *guard = cursor,
            Err(poisoned) => *poisoned.into_inner() = cursor,
        }
    }

    pub fn clear_cursor(&self) {
        self.set_cursor(None);
    }

    pub fn set_resumable(&self, resumable: bool) {
        self.resumable.store(resumable, Ordering::Release);
    }

    /// Whether a resume (rather than a full resync) is worth attempting
    /// after the next disconnect.
    pub fn can_resume(&self) -> bool {
        self.resumable.load(Ordering::Acquire) && self.cursor().is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Counters and teardown
    // ─────────────────────────────────────────────────────────────────────────

    pub fn record_event_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_applied(&self) -> u64 {
        self.events_applied.load(Ordering::Relaxed)
    }

    /// Tear the session down. Idempotent: the first call closes the
    /// connection and moves to `Closed`, later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let backend = self.take_backend().await;
        if let Some(backend) = backend {
            if let Err(e) = backend.close().await {
                debug!(cluster = %self.config.name, "closing backend: {e}");
            }
        }
        self.set_status(SessionStatus::Closed);
        info!(cluster = %self.config.name, "session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
