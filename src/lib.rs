//! # Mesh Mirror
//!
//! A multi-cluster mirroring agent that maintains a local, read-optimized
//! copy of every remote cluster's shared keyspace.
//!
//! ## Architecture
//!
//! The registry owns one session per remote cluster. Each session tails
//! its cluster's backend and applies events into a shared local mirror:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          RemoteClusterRegistry                           │
//! │                                                                          │
//! │  ┌──────────────────────┐    ┌───────────────┐    ┌───────────────────┐  │
//! │  │ RemoteClusterSession │───►│ snapshot +    │───►│ MirrorStore       │  │
//! │  │ (one per cluster)    │    │ watch stream  │    │ (per-cluster      │  │
//! │  └──────────────────────┘    └───────────────┘    │  namespaces)      │  │
//! │             │                                     └───────────────────┘  │
//! │             ▼                                               │            │
//! │  ┌──────────────────────┐                       ┌───────────────────┐    │
//! │  │ ReadinessTracker     │                       │ HeartbeatPublisher│    │
//! │  │ (sync gating)        │                       │ (leased liveness) │    │
//! │  └──────────────────────┘                       └───────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Mirroring Protocol
//!
//! 1. **Full sync**: Open the watch stream first, then fetch a snapshot,
//!    then sweep local entries the snapshot no longer contains. Entries
//!    that survive a resync are never transiently deleted.
//! 2. **Live tail**: Apply upserts and deletes from the watch stream in
//!    arrival order, tracking the backend's resume cursor.
//! 3. **Resume**: After a disconnect, re-watch from the last cursor when
//!    the backend can replay every missed event; otherwise fall back to a
//!    full sync.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mesh_mirror::backend::redis::RedisConnector;
//! use mesh_mirror::{MirrorConfig, RemoteClusterRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = MirrorConfig::load("mirror.json").expect("config");
//!
//!     let mut registry = RemoteClusterRegistry::new(config, Arc::new(RedisConnector))
//!         .expect("valid configuration");
//!     registry.start().await.expect("Failed to start");
//!
//!     // Registry runs until shutdown signal
//!     registry.shutdown().await;
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod mirror;
pub mod partition;
pub mod readiness;
pub mod registry;
pub mod resilience;
pub mod session;

// Re-exports for convenience
pub use config::{
    HeartbeatConfig, MirrorConfig, MirrorSettings, ReadinessConfig, RemoteClusterConfig,
    SupervisorConfig,
};
pub use error::{ErrorClass, MirrorError, Result};
pub use mirror::{ApplyOutcome, MirrorEvent, MirrorStore};
pub use partition::{ClusterCapacity, IdentityPartition};
pub use readiness::{ReadinessTracker, ReadyMode};
pub use registry::{ClusterHealth, HealthCheck, RegistryState, RemoteClusterRegistry};
pub use session::{RemoteClusterSession, SessionStatus};
