// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote cluster registry.
//!
//! The main orchestrator that ties together:
//! - Remote cluster sessions via [`crate::session::RemoteClusterSession`]
//! - The local mirror via [`crate::mirror::MirrorStore`]
//! - Readiness tracking via [`crate::readiness::ReadinessTracker`]
//! - The liveness heartbeat via [`crate::heartbeat::HeartbeatPublisher`]
//!
//! # Architecture
//!
//! The registry owns the full mirroring lifecycle:
//! 1. Validates configuration and allocates identity partitions
//! 2. Spawns one session task per remote cluster
//! 3. Re-evaluates readiness on a fixed tick, on top of change-driven
//!    evaluation inside the tracker
//! 4. Applies configuration changes at runtime (add, remove, replace
//!    clusters)
//! 5. Shuts down with full teardown: every session closed, every task
//!    awaited, the heartbeat key removed

mod session_task;
mod types;

pub use types::{ClusterHealth, HealthCheck, HeartbeatHealth, RegistryState};

use crate::backend::BackendConnector;
use crate::config::{MirrorConfig, RemoteClusterConfig};
use crate::error::{MirrorError, Result};
use crate::heartbeat::{HeartbeatHandle, HeartbeatPublisher};
use crate::metrics;
use crate::mirror::MirrorStore;
use crate::partition::IdentityPartition;
use crate::readiness::ReadinessTracker;
use crate::resilience::{Bulkhead, RateLimiter, RetryConfig};
use crate::session::RemoteClusterSession;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// How long shutdown waits for each task before giving up on it.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// How long a runtime cluster removal waits for the session task.
const SESSION_CLOSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// What a runtime configuration change did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfigChanges {
    /// Clusters that gained a new session.
    pub added: usize,
    /// Clusters whose session was torn down and whose mirrored entries
    /// were purged.
    pub removed: usize,
    /// Clusters whose address or id changed; their session was rebuilt.
    pub replaced: usize,
}

struct SessionEntry {
    session: Arc<RemoteClusterSession>,
    task: tokio::task::JoinHandle<()>,
}

/// The registry of remote cluster sessions.
///
/// Owns every session, the shared mirror they write into, the readiness
/// tracker, and the optional heartbeat publisher. One registry instance
/// serves one local cluster.
pub struct RemoteClusterRegistry<C: BackendConnector + 'static> {
    /// Configuration (replaced at runtime by `apply_config`)
    config: MirrorConfig,

    /// Identity slice owned by the local cluster itself
    local_partition: IdentityPartition,

    /// Registry state (broadcast to watchers)
    state_tx: watch::Sender<RegistryState>,

    /// Registry state receiver (for internal use)
    state_rx: watch::Receiver<RegistryState>,

    /// Connector that opens backend connections for sessions and heartbeat
    connector: Arc<C>,

    /// The local mirror every session writes into
    mirror: Arc<MirrorStore>,

    /// Tracks which clusters completed their initial sync
    readiness: Arc<ReadinessTracker>,

    /// Reconnect backoff shared by every session
    retry: RetryConfig,

    /// Event rate limiter shared by every session
    limiter: Arc<RateLimiter>,

    /// Bounds concurrent snapshot fetches across sessions
    snapshots: Arc<Bulkhead>,

    /// Live sessions by cluster name
    sessions: DashMap<String, SessionEntry>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Heartbeat health handle, present when the publisher is enabled
    heartbeat: Option<HeartbeatHandle>,

    /// Readiness tick and heartbeat task handles
    aux_handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl<C: BackendConnector + 'static> RemoteClusterRegistry<C> {
    /// Create a new registry.
    ///
    /// The registry starts in `Created` state. Call [`start()`](Self::start)
    /// to spawn sessions and begin mirroring.
    pub fn new(config: MirrorConfig, connector: Arc<C>) -> Result<Self> {
        config.validate()?;

        let local_partition =
            IdentityPartition::allocate(config.cluster_id, config.capacity())?;
        let (state_tx, state_rx) = watch::channel(RegistryState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mirror = Arc::new(MirrorStore::new(&config.settings.store_prefix));
        let readiness = Arc::new(ReadinessTracker::new(&config.settings.readiness));
        let retry = config.settings.supervisor.retry_config();
        let limiter = Arc::new(RateLimiter::new(config.settings.limits.rate_limit_config()));
        let snapshots = Arc::new(Bulkhead::new(config.settings.limits.snapshot_concurrency));

        Ok(Self {
            config,
            local_partition,
            state_tx,
            state_rx,
            connector,
            mirror,
            readiness,
            retry,
            limiter,
            snapshots,
            sessions: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
            heartbeat: None,
            aux_handles: RwLock::new(Vec::new()),
        })
    }

    /// Get current registry state.
    pub fn state(&self) -> RegistryState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<RegistryState> {
        self.state_rx.clone()
    }

    /// Check if the registry is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), RegistryState::Running)
    }

    /// The local cluster's name.
    pub fn local_cluster(&self) -> &str {
        &self.config.cluster_name
    }

    /// The identity partition owned by the local cluster. Identities
    /// minted locally must come from this slice.
    pub fn local_partition(&self) -> &IdentityPartition {
        &self.local_partition
    }

    /// The mirror every session writes into.
    pub fn mirror(&self) -> &Arc<MirrorStore> {
        &self.mirror
    }

    /// The readiness tracker.
    pub fn readiness(&self) -> &Arc<ReadinessTracker> {
        &self.readiness
    }

    /// Look up a session by cluster name.
    pub fn session(&self, cluster: &str) -> Option<Arc<RemoteClusterSession>> {
        self.sessions.get(cluster).map(|entry| entry.session.clone())
    }

    /// Names of all clusters with a live session, sorted.
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Start the registry.
    ///
    /// 1. Allocates an identity partition per remote cluster
    /// 2. Spawns one session task per remote cluster
    /// 3. Spawns the readiness tick task
    /// 4. Spawns the heartbeat publisher, if enabled
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != RegistryState::Created {
            return Err(MirrorError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            cluster = %self.config.cluster_name,
            cluster_id = self.config.cluster_id,
            remote_clusters = self.config.clusters.len(),
            capacity = self.config.capacity().max_cluster_id(),
            "Starting cluster registry"
        );
        let _ = self.state_tx.send(RegistryState::Starting);
        metrics::set_registry_state("Starting");

        for cluster in self.config.clusters.clone() {
            if let Err(e) = self.spawn_session(cluster) {
                let _ = self.state_tx.send(RegistryState::Failed);
                metrics::set_registry_state("Failed");
                return Err(e);
            }
        }

        self.spawn_readiness_tick().await;

        if self.config.heartbeat.enabled {
            self.spawn_heartbeat().await;
        }

        let _ = self.state_tx.send(RegistryState::Running);
        metrics::set_registry_state("Running");
        info!(
            sessions = self.sessions.len(),
            "Cluster registry running"
        );
        Ok(())
    }

    /// Allocate the cluster's partition, register it with readiness, and
    /// spawn its session task.
    fn spawn_session(&self, config: RemoteClusterConfig) -> Result<()> {
        let partition = IdentityPartition::allocate(config.cluster_id, self.config.capacity())?;
        let name = config.name.clone();
        let threshold = self.config.settings.supervisor.max_consecutive_quorum_errors;
        let session = Arc::new(RemoteClusterSession::new(config, partition, threshold));

        self.readiness.register_cluster(&name);

        let connector: Arc<dyn BackendConnector> = self.connector.clone();
        let task = tokio::spawn(session_task::run_session(
            session.clone(),
            self.mirror.clone(),
            self.readiness.clone(),
            connector,
            self.retry.clone(),
            self.limiter.clone(),
            self.snapshots.clone(),
            self.config.settings.remote_prefix.clone(),
            self.shutdown_rx.clone(),
        ));

        info!(
            cluster = %name,
            cluster_id = session.cluster_id(),
            "Spawned remote cluster session"
        );
        self.sessions.insert(name, SessionEntry { session, task });
        metrics::set_session_count(self.sessions.len());
        Ok(())
    }

    /// Spawn the task that re-evaluates readiness on a fixed tick, so the
    /// global and per-cluster timeouts fire even when no session makes
    /// progress. The same task refreshes registry-level gauges.
    async fn spawn_readiness_tick(&self) {
        let readiness = self.readiness.clone();
        let mirror = self.mirror.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let tick = self.config.settings.readiness.tick_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Readiness tick task stopping");
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        readiness.evaluate();
                        metrics::set_ready(readiness.is_ready());
                        metrics::set_mirror_entries(mirror.len());
                    }
                }
            }
        });

        debug!("Spawned readiness tick task");
        self.aux_handles.write().await.push(handle);
    }

    /// Spawn the heartbeat publisher task.
    async fn spawn_heartbeat(&mut self) {
        let connector: Arc<dyn BackendConnector> = self.connector.clone();
        let publisher = HeartbeatPublisher::new(
            &self.config.cluster_name,
            self.config.heartbeat.clone(),
            connector,
        );
        self.heartbeat = Some(publisher.handle());

        let shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(publisher.run(shutdown_rx));

        info!("Spawned heartbeat publisher");
        self.aux_handles.write().await.push(handle);
    }

    /// Apply a new configuration at runtime.
    ///
    /// Clusters present only in the new config gain a session; clusters
    /// that disappeared are torn down and their mirrored entries purged;
    /// clusters whose address or id changed are rebuilt. The local
    /// cluster's name and id and the mesh capacity cannot change without
    /// a restart.
    pub async fn apply_config(&mut self, new: MirrorConfig) -> Result<ConfigChanges> {
        if self.state() != RegistryState::Running {
            return Err(MirrorError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }
        new.validate()?;
        if new.cluster_name != self.config.cluster_name {
            return Err(MirrorError::Config(
                "local cluster name cannot change at runtime".to_string(),
            ));
        }
        if new.cluster_id != self.config.cluster_id {
            return Err(MirrorError::Config(
                "local cluster id cannot change at runtime".to_string(),
            ));
        }
        if new.capacity() != self.config.capacity() {
            return Err(MirrorError::Config(
                "cluster capacity cannot change at runtime".to_string(),
            ));
        }

        let mut changes = ConfigChanges::default();
        let mut rebuilt: Vec<RemoteClusterConfig> = Vec::new();

        // Tear down sessions that disappeared or changed
        let existing = self.cluster_names();
        for name in existing {
            let target = new.clusters.iter().find(|c| c.name == name);
            match target {
                Some(cfg) => {
                    let unchanged = self
                        .session(&name)
                        .map(|s| s.address() == cfg.address && s.cluster_id() == cfg.cluster_id)
                        .unwrap_or(false);
                    if !unchanged {
                        info!(cluster = %name, "Cluster definition changed, rebuilding session");
                        self.remove_session(&name).await;
                        rebuilt.push(cfg.clone());
                    }
                }
                None => {
                    self.remove_session(&name).await;
                    changes.removed += 1;
                }
            }
        }

        // Spawn what is missing
        for cfg in &new.clusters {
            if self.sessions.contains_key(&cfg.name) {
                continue;
            }
            let was_rebuilt = rebuilt.iter().any(|c| c.name == cfg.name);
            self.spawn_session(cfg.clone())?;
            if was_rebuilt {
                changes.replaced += 1;
            } else {
                changes.added += 1;
            }
        }

        info!(
            added = changes.added,
            removed = changes.removed,
            replaced = changes.replaced,
            "Applied configuration change"
        );
        self.config = new;
        Ok(changes)
    }

    /// Close one session, await its task, and purge its mirrored state.
    async fn remove_session(&self, name: &str) -> bool {
        let Some((_, entry)) = self.sessions.remove(name) else {
            return false;
        };
        entry.session.close().await;

        let mut task = entry.task;
        match drain_task(&mut task, SESSION_CLOSE_TIMEOUT).await {
            DrainOutcome::Completed => {}
            DrainOutcome::Panicked(e) => {
                warn!(cluster = %name, error = %e, "Session task panicked")
            }
            DrainOutcome::TimedOut => {
                warn!(cluster = %name, "Session task did not stop in time, aborted")
            }
        }

        let purged = self.mirror.purge_cluster(name);
        self.readiness.remove_cluster(name);
        metrics::set_session_count(self.sessions.len());
        info!(cluster = %name, purged, "Removed remote cluster");
        true
    }

    /// Get a health snapshot for monitoring endpoints.
    ///
    /// Performs no network I/O; everything comes from cached internal
    /// state (atomics, watch channels, the mirror's map).
    pub fn health_check(&self) -> HealthCheck {
        let mut clusters: Vec<ClusterHealth> = self
            .sessions
            .iter()
            .map(|entry| {
                let session = &entry.session;
                let name = session.cluster_name().to_string();
                ClusterHealth {
                    cluster_id: session.cluster_id(),
                    status: session.status(),
                    ready: self.readiness.is_cluster_ready(&name),
                    disregarded: self.readiness.is_cluster_disregarded(&name),
                    events_applied: session.events_applied(),
                    consecutive_quorum_errors: session.quorum_error_count(),
                    mirrored_entries: self.mirror.cluster_len(&name),
                    name,
                }
            })
            .collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));

        let heartbeat = self.heartbeat.as_ref().map(|handle| HeartbeatHealth {
            live: handle.is_live(),
            consecutive_failures: handle.consecutive_failures(),
            seconds_since_success: handle.last_success_age().map(|age| age.as_secs()),
        });

        HealthCheck {
            local_cluster: self.config.cluster_name.clone(),
            state: self.state().to_string(),
            ready: self.readiness.is_ready(),
            ready_mode: self.readiness.ready_mode().map(|mode| mode.to_string()),
            mirrored_entries: self.mirror.len(),
            heartbeat,
            clusters,
        }
    }

    /// Shutdown the registry gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal every task to stop
    /// 2. Close every session, which tears down its backend connection
    /// 3. Await session and auxiliary tasks, aborting any that exceed
    ///    the drain timeout
    ///
    /// The heartbeat task deletes its key on the way out.
    pub async fn shutdown(&mut self) {
        info!("Shutting down cluster registry");
        let _ = self.state_tx.send(RegistryState::ShuttingDown);
        metrics::set_registry_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        // Close sessions so blocked watch reads end immediately
        let names = self.cluster_names();
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            if let Some((_, entry)) = self.sessions.remove(&name) {
                entry.session.close().await;
                handles.push((name, entry.task));
            }
        }
        let aux: Vec<_> = {
            let mut guard = self.aux_handles.write().await;
            std::mem::take(&mut *guard)
        };

        if !handles.is_empty() || !aux.is_empty() {
            info!(
                sessions = handles.len(),
                auxiliary = aux.len(),
                "Waiting for tasks to stop"
            );
        }

        for (name, mut handle) in handles {
            match drain_task(&mut handle, DRAIN_TIMEOUT).await {
                DrainOutcome::Completed => debug!(cluster = %name, "Session task completed"),
                DrainOutcome::Panicked(e) => {
                    warn!(cluster = %name, error = %e, "Session task panicked during shutdown")
                }
                DrainOutcome::TimedOut => {
                    warn!(cluster = %name, "Session task did not stop in time, aborted")
                }
            }
        }
        for (i, mut handle) in aux.into_iter().enumerate() {
            match drain_task(&mut handle, DRAIN_TIMEOUT).await {
                DrainOutcome::Completed => debug!(task = i + 1, "Auxiliary task completed"),
                DrainOutcome::Panicked(e) => {
                    warn!(task = i + 1, error = %e, "Auxiliary task panicked during shutdown")
                }
                DrainOutcome::TimedOut => {
                    warn!(task = i + 1, "Auxiliary task did not stop in time, aborted")
                }
            }
        }

        metrics::set_session_count(0);
        let _ = self.state_tx.send(RegistryState::Stopped);
        metrics::set_registry_state("Stopped");
        info!("Cluster registry stopped");
    }
}

/// How a drained task ended.
#[derive(Debug)]
enum DrainOutcome {
    Completed,
    Panicked(tokio::task::JoinError),
    TimedOut,
}

/// Await a task for up to `deadline`, aborting it on timeout.
///
/// A task that ignores its shutdown signal is cancelled rather than
/// leaked past teardown.
async fn drain_task(
    task: &mut tokio::task::JoinHandle<()>,
    deadline: std::time::Duration,
) -> DrainOutcome {
    match tokio::time::timeout(deadline, &mut *task).await {
        Ok(Ok(())) => DrainOutcome::Completed,
        Ok(Err(e)) => DrainOutcome::Panicked(e),
        Err(_) => {
            task.abort();
            DrainOutcome::TimedOut
        }
    }
}
