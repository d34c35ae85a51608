//! Registry lifecycle types and health reporting.
//!
//! Defines the state machine for the registry lifecycle and the
//! structures returned by [`health_check()`](super::RemoteClusterRegistry::health_check).
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (never started)             │ (sessions spawned)
//!    ↓                              ↓
//! Stopped ←──── ShuttingDown ←── Running
//!                    ↑
//!                    │ shutdown()
//!                    │
//!          (invalid configuration)
//!                    ↓
//!                 Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `RemoteClusterRegistry::new()`. No sessions exist.
//! - **Starting**: `start()` called, allocating partitions and spawning session tasks.
//! - **Running**: Normal operation. One task per remote cluster mirrors its keyspace.
//! - **ShuttingDown**: `shutdown()` called. Sessions are closing and tasks draining.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Startup rejected the configuration. The registry cannot continue.

use crate::session::SessionStatus;
use serde::Serialize;

/// State of the cluster registry.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// Registry created but not started.
    ///
    /// Call [`start()`](super::RemoteClusterRegistry::start) to begin mirroring.
    Created,

    /// Spawning one session task per configured remote cluster.
    ///
    /// Transitions to `Running` once every task is spawned, or `Failed`
    /// if the configuration does not validate.
    Starting,

    /// Running and mirroring.
    ///
    /// Session tasks are syncing and tailing their remote keyspaces.
    /// The readiness tracker is being evaluated on every change and tick.
    Running,

    /// Shutting down gracefully.
    ///
    /// Sessions are being closed and their tasks awaited.
    /// Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Stopped.
    ///
    /// The registry has shut down cleanly. Safe to drop.
    Stopped,

    /// Failed to start.
    ///
    /// Check logs for error details. The registry cannot recover from
    /// this state.
    Failed,
}

impl std::fmt::Display for RegistryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryState::Created => write!(f, "Created"),
            RegistryState::Starting => write!(f, "Starting"),
            RegistryState::Running => write!(f, "Running"),
            RegistryState::ShuttingDown => write!(f, "ShuttingDown"),
            RegistryState::Stopped => write!(f, "Stopped"),
            RegistryState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health snapshot of the whole registry.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Name of the local cluster.
    pub local_cluster: String,
    /// Registry lifecycle state, as displayed.
    pub state: String,
    /// Whether global readiness has latched.
    pub ready: bool,
    /// How readiness latched, if it has ("all-synced", "laggards-disregarded",
    /// "timed-out").
    pub ready_mode: Option<String>,
    /// Total mirrored entries across all clusters.
    pub mirrored_entries: usize,
    /// Heartbeat publisher health, if the publisher is enabled.
    pub heartbeat: Option<HeartbeatHealth>,
    /// Per-cluster session health, sorted by cluster name.
    pub clusters: Vec<ClusterHealth>,
}

/// Health of a single remote cluster session.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub name: String,
    pub cluster_id: u32,
    /// Session lifecycle status.
    pub status: SessionStatus,
    /// Whether this cluster has completed its initial sync.
    pub ready: bool,
    /// Whether readiness gave up waiting for this cluster.
    pub disregarded: bool,
    /// Events applied to the mirror since the session was created.
    pub events_applied: u64,
    /// Consecutive quorum errors observed on the current connection.
    pub consecutive_quorum_errors: u32,
    /// Entries currently mirrored for this cluster.
    pub mirrored_entries: usize,
}

/// Health of the heartbeat publisher.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatHealth {
    /// Whether a write was confirmed within the lease TTL.
    pub live: bool,
    pub consecutive_failures: u32,
    /// Seconds since the last confirmed write, if there ever was one.
    pub seconds_since_success: Option<u64>,
}
