// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The mirror engine: a local, namespaced copy of every remote cluster's
//! entries.
//!
//! Each remote key is stored under `<store_prefix>/<cluster>/<remote_key>`.
//! Cluster names cannot contain `/`, so the mapping is injective and two
//! clusters can never collide, whatever their remote keys look like.
//!
//! # Ordering
//!
//! [`MirrorStore::apply`] relies on the caller applying one cluster's
//! events in arrival order from a single task. Different clusters may apply
//! concurrently; their keyspaces are disjoint by construction.
//!
//! # Resync without disruption
//!
//! A session that lost its watch position replays the remote state from a
//! fresh snapshot. The naive approach (drop the cluster's entries, insert
//! the snapshot) would make keys that exist in both the old and new state
//! transiently unobservable. Instead:
//!
//! 1. `SnapshotReset` starts tracking the keys the new snapshot mentions.
//! 2. Upserts overwrite in place. Readers see the old or the new value,
//!    never absence.
//! 3. `SnapshotComplete` sweeps only entries the new snapshot never
//!    mentioned. Those were deleted remotely while the watch was down.

use crate::backend::KvPair;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

/// One change for the mirror to apply, in a cluster's event order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    Upsert { key: String, value: Vec<u8> },
    Delete { key: String },
    /// A fresh snapshot replay begins; start tracking which keys it mentions.
    SnapshotReset,
    /// The snapshot replay is done; sweep entries it never mentioned.
    SnapshotComplete,
}

/// What applying one event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new or changed value was stored.
    Upserted,
    /// The stored value was already byte-identical; nothing changed.
    Unchanged,
    Deleted,
    /// Delete for a key that was not present.
    Absent,
    ResyncStarted,
    /// Resync finished; `swept` stale entries were removed.
    ResyncCompleted { swept: usize },
}

#[derive(Default)]
struct ClusterState {
    /// Keys (in local form) the current snapshot replay has mentioned.
    /// `Some` while a resync is in progress.
    resync: Option<HashSet<String>>,
}

/// The local mirrored view of all remote clusters.
pub struct MirrorStore {
    store_prefix: String,
    entries: DashMap<String, Vec<u8>>,
    clusters: DashMap<String, ClusterState>,
}

impl MirrorStore {
    pub fn new(store_prefix: impl Into<String>) -> Self {
        Self {
            store_prefix: store_prefix.into(),
            entries: DashMap::new(),
            clusters: DashMap::new(),
        }
    }

    /// The local key a remote key is mirrored under.
    pub fn local_key(&self, cluster: &str, remote_key: &str) -> String {
        local_key_for(&self.store_prefix, cluster, remote_key)
    }

    /// Apply one event from a cluster's ordered stream.
    pub fn apply(&self, cluster: &str, event: MirrorEvent) -> ApplyOutcome {
        match event {
            MirrorEvent::Upsert { key, value } => self.apply_upsert(cluster, &key, value),
            MirrorEvent::Delete { key } => self.apply_delete(cluster, &key),
            MirrorEvent::SnapshotReset => {
                let mut state = self.clusters.entry(cluster.to_string()).or_default();
                // A reset during an unfinished resync discards the old
                // tracking; only a completed replay may sweep.
                state.resync = Some(HashSet::new());
                debug!(cluster, "resync started");
                ApplyOutcome::ResyncStarted
            }
            MirrorEvent::SnapshotComplete => self.apply_snapshot_complete(cluster),
        }
    }

    fn apply_upsert(&self, cluster: &str, key: &str, value: Vec<u8>) -> ApplyOutcome {
        let local = self.local_key(cluster, key);

        // Membership must be recorded even for unchanged values, or the
        // sweep would treat them as stale.
        if let Some(mut state) = self.clusters.get_mut(cluster) {
            if let Some(seen) = state.resync.as_mut() {
                seen.insert(local.clone());
            }
        }

        match self.entries.entry(local) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get() == &value {
                    ApplyOutcome::Unchanged
                } else {
                    occupied.insert(value);
                    ApplyOutcome::Upserted
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(value);
                ApplyOutcome::Upserted
            }
        }
    }

    fn apply_delete(&self, cluster: &str, key: &str) -> ApplyOutcome {
        let local = self.local_key(cluster, key);

        if let Some(mut state) = self.clusters.get_mut(cluster) {
            if let Some(seen) = state.resync.as_mut() {
                seen.remove(&local);
            }
        }

        if self.entries.remove(&local).is_some() {
            ApplyOutcome::Deleted
        } else {
            ApplyOutcome::Absent
        }
    }

    fn apply_snapshot_complete(&self, cluster: &str) -> ApplyOutcome {
        let seen = match self.clusters.get_mut(cluster) {
            Some(mut state) => state.resync.take(),
            None => None,
        };
        let Some(seen) = seen else {
            // Complete without a reset: initial sync into an empty
            // namespace, nothing can be stale.
            return ApplyOutcome::ResyncCompleted { swept: 0 };
        };

        let namespace = cluster_namespace(&self.store_prefix, cluster);
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&namespace) && !seen.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        let swept = stale.len();
        for key in stale {
            self.entries.remove(&key);
        }
        if swept > 0 {
            debug!(cluster, swept, "resync swept stale entries");
        }
        ApplyOutcome::ResyncCompleted { swept }
    }

    /// Remove everything mirrored from a cluster. Used when a cluster
    /// leaves the configuration.
    pub fn purge_cluster(&self, cluster: &str) -> usize {
        self.clusters.remove(cluster);
        let namespace = cluster_namespace(&self.store_prefix, cluster);
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&namespace))
            .map(|entry| entry.key().clone())
            .collect();
        let purged = doomed.len();
        for key in doomed {
            self.entries.remove(&key);
        }
        purged
    }

    /// Read a mirrored value by cluster and remote key.
    pub fn get(&self, cluster: &str, remote_key: &str) -> Option<Vec<u8>> {
        self.entries
            .get(&self.local_key(cluster, remote_key))
            .map(|entry| entry.clone())
    }

    /// Read a mirrored value by its full local key.
    pub fn get_local(&self, local_key: &str) -> Option<Vec<u8>> {
        self.entries.get(local_key).map(|entry| entry.clone())
    }

    /// All entries mirrored from one cluster, sorted by local key.
    pub fn cluster_entries(&self, cluster: &str) -> Vec<KvPair> {
        let namespace = cluster_namespace(&self.store_prefix, cluster);
        let mut pairs: Vec<KvPair> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&namespace))
            .map(|entry| KvPair::new(entry.key().clone(), entry.value().clone()))
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        pairs
    }

    pub fn cluster_len(&self, cluster: &str) -> usize {
        let namespace = cluster_namespace(&self.store_prefix, cluster);
        self.entries
            .iter()
            .filter(|entry| entry.key().starts_with(&namespace))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a snapshot replay is currently in progress for a cluster.
    pub fn is_resyncing(&self, cluster: &str) -> bool {
        self.clusters
            .get(cluster)
            .map(|state| state.resync.is_some())
            .unwrap_or(false)
    }
}

fn cluster_namespace(store_prefix: &str, cluster: &str) -> String {
    format!("{store_prefix}/{cluster}/")
}

/// Build the local key for a remote key. Pure.
pub fn local_key_for(store_prefix: &str, cluster: &str, remote_key: &str) -> String {
    format!("{store_prefix}/{cluster}/{remote_key}")
}

/// Split a local key back into `(cluster, remote_key)`.
///
/// Inverse of [`local_key_for`] for every valid cluster name, because the
/// name charset excludes `/`.
pub fn parse_local_key<'a>(store_prefix: &str, local_key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = local_key.strip_prefix(store_prefix)?.strip_prefix('/')?;
    let (cluster, remote_key) = rest.split_once('/')?;
    if cluster.is_empty() {
        return None;
    }
    Some((cluster, remote_key))
}
