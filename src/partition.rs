// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identity partition allocation.
//!
//! Every remote cluster gets a disjoint slice of the numeric identity space
//! so that identities minted in different clusters never collide. The slice
//! is derived purely from the cluster id and the mesh capacity by fixed-width
//! bit-slicing: no state, no coordination, and two independently restarted
//! aggregators always agree.
//!
//! ```text
//! 24-bit identity space, capacity 255 (8 cluster bits):
//!
//!   23      16 15               0
//!  ┌──────────┬─────────────────┐
//!  │ clusterID│  local identity │   cluster 7 → [0x070000, 0x080000)
//!  └──────────┴─────────────────┘
//!
//! capacity 511 shifts the boundary one bit right (9 cluster bits).
//! ```
//!
//! Capacity is a closed set: 255 or 511. Anything else is a configuration
//! error and is rejected before any session starts.

use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};

/// Width of the global identity space in bits.
pub const IDENTITY_SPACE_BITS: u32 = 24;

/// Supported mesh capacities (maximum number of connected clusters).
///
/// Serialized as its numeric value, so configuration files carry `255` or
/// `511` and any other number fails deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ClusterCapacity {
    /// Up to 255 clusters, 8 bits of cluster id.
    Standard,
    /// Up to 511 clusters, 9 bits of cluster id.
    Extended,
}

impl ClusterCapacity {
    /// The maximum cluster id under this capacity.
    pub fn max_cluster_id(&self) -> u32 {
        match self {
            Self::Standard => 255,
            Self::Extended => 511,
        }
    }

    /// Number of identity-space bits consumed by the cluster id.
    pub fn cluster_bits(&self) -> u32 {
        match self {
            Self::Standard => 8,
            Self::Extended => 9,
        }
    }

    /// Number of identities in each per-cluster slice.
    pub fn slice_width(&self) -> u32 {
        1 << (IDENTITY_SPACE_BITS - self.cluster_bits())
    }
}

impl Default for ClusterCapacity {
    fn default() -> Self {
        Self::Standard
    }
}

impl From<ClusterCapacity> for u32 {
    fn from(c: ClusterCapacity) -> u32 {
        c.max_cluster_id()
    }
}

impl TryFrom<u32> for ClusterCapacity {
    type Error = MirrorError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            255 => Ok(Self::Standard),
            511 => Ok(Self::Extended),
            other => Err(MirrorError::Config(format!(
                "unsupported max-connected-clusters {} (must be 255 or 511)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ClusterCapacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.max_cluster_id())
    }
}

/// A contiguous, disjoint slice of the identity space owned by one cluster.
///
/// `start` is inclusive, `end` exclusive. The partition remembers the
/// capacity it was derived under: slices computed under 255 and 511 do not
/// line up, so a consumer holding a partition from a previous capacity must
/// treat the mismatch as a remap and flush derived state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPartition {
    pub cluster_id: u32,
    pub capacity: ClusterCapacity,
    pub start: u32,
    pub end: u32,
}

impl IdentityPartition {
    /// Derive the partition for a cluster id under the given capacity.
    ///
    /// Pure function of its inputs: the same (id, capacity) pair always
    /// yields the same range, across calls and across restarts.
    pub fn allocate(cluster_id: u32, capacity: ClusterCapacity) -> Result<Self> {
        if cluster_id == 0 || cluster_id > capacity.max_cluster_id() {
            return Err(MirrorError::Config(format!(
                "cluster id {} outside [1, {}]",
                cluster_id,
                capacity.max_cluster_id()
            )));
        }

        let shift = IDENTITY_SPACE_BITS - capacity.cluster_bits();
        let start = cluster_id << shift;
        Ok(Self {
            cluster_id,
            capacity,
            start,
            end: start + capacity.slice_width(),
        })
    }

    /// Number of identities in this partition.
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether a numeric identity falls inside this partition.
    pub fn contains(&self, identity: u32) -> bool {
        identity >= self.start && identity < self.end
    }

    /// Whether two partitions share any identity.
    pub fn overlaps(&self, other: &IdentityPartition) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether this partition is still valid under the given capacity.
    ///
    /// False means the mesh capacity changed since the partition was derived
    /// and all identities sliced from it must be re-derived.
    pub fn is_compatible_with(&self, capacity: ClusterCapacity) -> bool {
        self.capacity == capacity
    }
}

impl std::fmt::Display for IdentityPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cluster {} => [{:#08x}, {:#08x}) /{}",
            self.cluster_id, self.start, self.end, self.capacity
        )
    }
}
