//! Sync readiness tracking across all remote clusters.
//!
//! Consumers of the mirror should not serve from it before it holds a
//! reasonably complete view. The tracker answers "complete enough" under
//! two bounded-wait rules:
//!
//! - A cluster that has not finished its initial sync within the
//!   per-cluster budget stops blocking global readiness. It is reported
//!   not-ready itself until it eventually syncs.
//! - After the global budget, readiness is forced regardless of state.
//!   A mesh with one dead member must not keep a whole cluster's agents
//!   unready forever.
//!
//! Readiness is evaluated whenever the inputs change and once per tick, so
//! pure time-based transitions fire without any cluster activity. Once
//! reached, readiness is permanent.

use crate::config::ReadinessConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// How global readiness was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyMode {
    /// Every registered cluster finished its initial sync.
    AllSynced,
    /// All clusters either synced or overran their per-cluster budget.
    LaggardsDisregarded,
    /// The global budget expired first.
    TimedOut,
}

impl std::fmt::Display for ReadyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AllSynced => "all-synced",
            Self::LaggardsDisregarded => "laggards-disregarded",
            Self::TimedOut => "timed-out",
        };
        write!(f, "{s}")
    }
}

struct ClusterReadiness {
    registered_at: Instant,
    synced: bool,
    disregarded: bool,
}

struct Inner {
    clusters: HashMap<String, ClusterReadiness>,
    ready: Option<ReadyMode>,
}

/// Tracks which clusters have finished their initial sync.
pub struct ReadinessTracker {
    global_budget: Duration,
    per_cluster_budget: Duration,
    started_at: Instant,
    inner: Mutex<Inner>,
    ready_tx: watch::Sender<bool>,
}

impl ReadinessTracker {
    pub fn new(config: &ReadinessConfig) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            global_budget: config.global_ready_timeout_duration(),
            per_cluster_budget: config.per_cluster_ready_timeout_duration(),
            started_at: Instant::now(),
            inner: Mutex::new(Inner {
                clusters: HashMap::new(),
                ready: None,
            }),
            ready_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start tracking a cluster. Registration after readiness latched does
    /// not unlatch it.
    pub fn register_cluster(&self, cluster: &str) {
        {
            let mut inner = self.lock();
            inner.clusters.insert(
                cluster.to_string(),
                ClusterReadiness {
                    registered_at: Instant::now(),
                    synced: false,
                    disregarded: false,
                },
            );
        }
        self.evaluate();
    }

    /// Stop tracking a cluster, e.g. when it leaves the configuration.
    pub fn remove_cluster(&self, cluster: &str) {
        {
            let mut inner = self.lock();
            inner.clusters.remove(cluster);
        }
        self.evaluate();
    }

    /// Record that a cluster finished its initial sync. Sticky: later
    /// reconnects and resyncs do not unset it.
    pub fn mark_synced(&self, cluster: &str) {
        {
            let mut inner = self.lock();
            if let Some(state) = inner.clusters.get_mut(cluster) {
                if !state.synced {
                    debug!(cluster, "initial sync complete");
                }
                state.synced = true;
                state.disregarded = false;
            }
        }
        self.evaluate();
    }

    /// Whether this cluster finished its initial sync.
    pub fn is_cluster_ready(&self, cluster: &str) -> bool {
        self.lock()
            .clusters
            .get(cluster)
            .map(|state| state.synced)
            .unwrap_or(false)
    }

    /// Whether this cluster overran its budget and no longer blocks global
    /// readiness.
    pub fn is_cluster_disregarded(&self, cluster: &str) -> bool {
        self.lock()
            .clusters
            .get(cluster)
            .map(|state| state.disregarded)
            .unwrap_or(false)
    }

    /// Global readiness. Permanent once reached.
    pub fn is_ready(&self) -> bool {
        self.lock().ready.is_some()
    }

    /// How readiness was reached, if it has been.
    pub fn ready_mode(&self) -> Option<ReadyMode> {
        self.lock().ready
    }

    /// Observe global readiness changes. The value flips to `true` exactly
    /// once.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Re-derive readiness from the current state and the clock. Called
    /// after every input change and from the periodic tick.
    pub fn evaluate(&self) {
        let mode = {
            let mut inner = self.lock();
            if inner.ready.is_some() {
                return;
            }

            let now = Instant::now();
            if now.duration_since(self.started_at) >= self.global_budget {
                inner.ready = Some(ReadyMode::TimedOut);
                Some(ReadyMode::TimedOut)
            } else {
                let mut any_disregarded = false;
                let mut all_accounted = true;
                for state in inner.clusters.values_mut() {
                    if state.synced {
                        continue;
                    }
                    if now.duration_since(state.registered_at) >= self.per_cluster_budget {
                        state.disregarded = true;
                    }
                    if state.disregarded {
                        any_disregarded = true;
                    } else {
                        all_accounted = false;
                    }
                }

                if all_accounted {
                    let mode = if any_disregarded {
                        ReadyMode::LaggardsDisregarded
                    } else {
                        ReadyMode::AllSynced
                    };
                    inner.ready = Some(mode);
                    Some(mode)
                } else {
                    None
                }
            }
        };

        if let Some(mode) = mode {
            info!(%mode, "mirror is ready");
            let _ = self.ready_tx.send(true);
        }
    }
}
