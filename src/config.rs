//! Configuration for the mirror engine.
//!
//! This module defines all configuration types needed to run the mirror
//! engine. Configuration is passed to
//! [`RemoteClusterRegistry::new()`](crate::RemoteClusterRegistry::new) and can
//! be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use mesh_mirror::config::{MirrorConfig, RemoteClusterConfig};
//!
//! let config = MirrorConfig {
//!     cluster_name: "berlin".into(),
//!     clusters: vec![
//!         RemoteClusterConfig::for_testing("paris", 2, "mem://paris"),
//!     ],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MirrorConfig
//! ├── cluster_name: String             # Local cluster's name
//! ├── cluster_id: u32                  # Local cluster's mesh id
//! ├── settings: MirrorSettings
//! │   ├── max_connected_clusters       # Mesh capacity: 255 or 511
//! │   ├── remote_prefix / store_prefix # Watched prefix, local namespace root
//! │   ├── supervisor: SupervisorConfig # Quorum threshold, reconnect backoff
//! │   ├── readiness: ReadinessConfig   # Global and per-cluster timeouts
//! │   └── limits: LimitsConfig         # Event rate, snapshot concurrency
//! ├── clusters: Vec<RemoteClusterConfig>  # Remote clusters to mirror
//! └── heartbeat: HeartbeatConfig       # Leased liveness key
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "cluster_name": "berlin",
//!   "cluster_id": 1,
//!   "settings": {
//!     "max_connected_clusters": 255,
//!     "supervisor": { "max_consecutive_quorum_errors": 2 },
//!     "readiness": { "global_ready_timeout": "10m", "per_cluster_ready_timeout": "15s" }
//!   },
//!   "clusters": [
//!     { "name": "paris", "cluster_id": 2, "address": "redis://paris:6379" }
//!   ],
//!   "heartbeat": { "enabled": true, "address": "redis://local:6379" }
//! }
//! ```

use crate::error::{MirrorError, Result};
use crate::partition::ClusterCapacity;
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from the daemon to RemoteClusterRegistry::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RemoteClusterRegistry::new()`.
///
/// # Fields
///
/// - `cluster_name`: This cluster's own name, excluded from the remote set.
/// - `cluster_id`: This cluster's own mesh id; remotes may not reuse it.
/// - `settings`: Tunables for capacity, supervision, readiness, and limits.
/// - `clusters`: The remote clusters to mirror.
/// - `heartbeat`: Leased liveness key settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// The local cluster's name. Remote cluster names must differ from it.
    pub cluster_name: String,

    /// The local cluster's mesh id. Owns an identity partition like any
    /// remote id, so remotes may not reuse it.
    #[serde(default = "default_local_cluster_id")]
    pub cluster_id: u32,

    /// General settings for the mirroring logic (capacity, timeouts, limits).
    #[serde(default)]
    pub settings: MirrorSettings,

    /// The remote clusters to mirror. Each entry owns one session.
    #[serde(default)]
    pub clusters: Vec<RemoteClusterConfig>,

    /// Heartbeat publisher settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            cluster_id: default_local_cluster_id(),
            settings: MirrorSettings::default(),
            clusters: Vec::new(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

fn default_local_cluster_id() -> u32 {
    1
}

impl MirrorConfig {
    /// Create a minimal config for testing, with fast supervisor and
    /// readiness timings.
    pub fn for_testing(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            cluster_id: 1,
            settings: MirrorSettings {
                supervisor: SupervisorConfig::for_testing(),
                readiness: ReadinessConfig::for_testing(),
                ..MirrorSettings::default()
            },
            clusters: Vec::new(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// The configured mesh capacity.
    pub fn capacity(&self) -> ClusterCapacity {
        self.settings.max_connected_clusters
    }

    /// Load and validate a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MirrorError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| MirrorError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Append remote clusters from a directory of per-cluster JSON files.
    ///
    /// Each `*.json` file holds one [`RemoteClusterConfig`]. Files are read
    /// in name order so the resulting cluster list is deterministic. The
    /// merged config is re-validated. Returns the number of clusters added.
    pub fn load_cluster_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| MirrorError::Config(format!("read dir {}: {}", dir.display(), e)))?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut added = 0;
        for path in paths {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| MirrorError::Config(format!("read {}: {}", path.display(), e)))?;
            let cluster: RemoteClusterConfig = serde_json::from_str(&raw)
                .map_err(|e| MirrorError::Config(format!("parse {}: {}", path.display(), e)))?;
            self.clusters.push(cluster);
            added += 1;
        }

        self.validate()?;
        Ok(added)
    }

    /// Validate the whole configuration.
    ///
    /// Violations here are fatal: the registry refuses to start rather than
    /// supervise a mesh with ambiguous identities.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_cluster_name(&self.cluster_name) {
            return Err(MirrorError::Config(format!(
                "invalid local cluster name {:?}",
                self.cluster_name
            )));
        }

        let capacity = self.settings.max_connected_clusters;
        if self.cluster_id == 0 || self.cluster_id > capacity.max_cluster_id() {
            return Err(MirrorError::Config(format!(
                "local cluster id {} outside [1, {}]",
                self.cluster_id,
                capacity.max_cluster_id()
            )));
        }

        // The local id owns a partition too; remotes may not reuse it.
        let mut seen_ids = HashSet::from([self.cluster_id]);
        let mut seen_names = HashSet::new();

        for cluster in &self.clusters {
            if !is_valid_cluster_name(&cluster.name) {
                return Err(MirrorError::Config(format!(
                    "invalid cluster name {:?}",
                    cluster.name
                )));
            }
            if cluster.name == self.cluster_name {
                return Err(MirrorError::Config(format!(
                    "remote cluster {:?} collides with the local cluster name",
                    cluster.name
                )));
            }
            if cluster.cluster_id == 0 || cluster.cluster_id > capacity.max_cluster_id() {
                return Err(MirrorError::Config(format!(
                    "cluster {:?} id {} outside [1, {}]",
                    cluster.name,
                    cluster.cluster_id,
                    capacity.max_cluster_id()
                )));
            }
            if !seen_ids.insert(cluster.cluster_id) {
                return Err(MirrorError::Config(format!(
                    "duplicate cluster id {}",
                    cluster.cluster_id
                )));
            }
            if !seen_names.insert(cluster.name.as_str()) {
                return Err(MirrorError::Config(format!(
                    "duplicate cluster name {:?}",
                    cluster.name
                )));
            }
            if cluster.address.is_empty() {
                return Err(MirrorError::Config(format!(
                    "cluster {:?} has an empty address",
                    cluster.name
                )));
            }
        }

        self.settings.supervisor.validate()?;
        self.settings.readiness.validate()?;
        self.settings.limits.validate()?;
        self.heartbeat.validate()?;

        Ok(())
    }
}

/// Check a cluster name: 1-32 chars of `[a-z0-9-]`, alphanumeric at both
/// ends. The charset can never contain the `/` namespace separator, which is
/// what keeps local-key namespacing injective.
pub fn is_valid_cluster_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 32 {
        return false;
    }
    let bytes = name.as_bytes();
    let ok_inner = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-';
    let ok_edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    ok_edge(bytes[0])
        && ok_edge(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| ok_inner(b))
}

// ═══════════════════════════════════════════════════════════════════════════════
// MirrorSettings: capacity, prefixes, supervision, readiness, limits
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the mirroring logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSettings {
    /// Mesh capacity: the maximum number of connected clusters, 255 or 511.
    /// Also fixes the identity-partition slicing.
    #[serde(default)]
    pub max_connected_clusters: ClusterCapacity,

    /// The key prefix listed and watched on each remote backend.
    #[serde(default = "default_remote_prefix")]
    pub remote_prefix: String,

    /// The local namespace root mirrored entries are stored under.
    #[serde(default = "default_store_prefix")]
    pub store_prefix: String,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_remote_prefix() -> String {
    "mesh/state".to_string()
}

fn default_store_prefix() -> String {
    "mesh/cache".to_string()
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            max_connected_clusters: ClusterCapacity::default(),
            remote_prefix: default_remote_prefix(),
            store_prefix: default_store_prefix(),
            supervisor: SupervisorConfig::default(),
            readiness: ReadinessConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SupervisorConfig: quorum threshold and reconnect backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection supervisor tunables.
///
/// The quorum threshold is the number of consecutive quorum failures after
/// which the session's connection is torn down and re-established from
/// scratch. Reconnects back off exponentially with jitter and never give up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Consecutive quorum errors that trigger a full reconnect.
    #[serde(default = "default_max_consecutive_quorum_errors")]
    pub max_consecutive_quorum_errors: u32,

    /// Initial reconnect delay (humantime string, e.g. "1s").
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Reconnect delay ceiling (humantime string, e.g. "5m").
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    /// Timeout for each individual connection attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_max_consecutive_quorum_errors() -> u32 {
    2
}

fn default_retry_initial_delay() -> String {
    "1s".to_string()
}

fn default_retry_max_delay() -> String {
    "5m".to_string()
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_quorum_errors: 2,
            retry_initial_delay: "1s".to_string(),
            retry_max_delay: "5m".to_string(),
            connect_timeout: "10s".to_string(),
        }
    }
}

impl SupervisorConfig {
    /// Fast timings for tests.
    pub fn for_testing() -> Self {
        Self {
            max_consecutive_quorum_errors: 2,
            retry_initial_delay: "10ms".to_string(),
            retry_max_delay: "100ms".to_string(),
            connect_timeout: "500ms".to_string(),
        }
    }

    pub fn retry_initial_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_initial_delay).unwrap_or(Duration::from_secs(1))
    }

    pub fn retry_max_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_max_delay).unwrap_or(Duration::from_secs(300))
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// The retry policy sessions use for connects and reconnects.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: self.retry_initial_delay_duration(),
            max_delay: self.retry_max_delay_duration(),
            backoff_factor: 2.0,
            connection_timeout: self.connect_timeout_duration(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_consecutive_quorum_errors == 0 {
            return Err(MirrorError::Config(
                "max_consecutive_quorum_errors must be at least 1".to_string(),
            ));
        }
        parse_duration_field("supervisor.retry_initial_delay", &self.retry_initial_delay)?;
        parse_duration_field("supervisor.retry_max_delay", &self.retry_max_delay)?;
        parse_duration_field("supervisor.connect_timeout", &self.connect_timeout)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReadinessConfig: global and per-cluster sync timeouts
// ═══════════════════════════════════════════════════════════════════════════════

/// Readiness timeout budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// After this much time since startup, global readiness is forced true
    /// even if some clusters never synced (humantime string).
    #[serde(default = "default_global_ready_timeout")]
    pub global_ready_timeout: String,

    /// A cluster that has not finished its snapshot within this budget is
    /// disregarded: it stops blocking global readiness.
    #[serde(default = "default_per_cluster_ready_timeout")]
    pub per_cluster_ready_timeout: String,

    /// How often the timeouts are re-evaluated in addition to state-change
    /// triggered evaluation.
    #[serde(default = "default_readiness_tick")]
    pub tick: String,
}

fn default_global_ready_timeout() -> String {
    "10m".to_string()
}

fn default_per_cluster_ready_timeout() -> String {
    "15s".to_string()
}

fn default_readiness_tick() -> String {
    "5s".to_string()
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            global_ready_timeout: "10m".to_string(),
            per_cluster_ready_timeout: "15s".to_string(),
            tick: "5s".to_string(),
        }
    }
}

impl ReadinessConfig {
    /// Short budgets for tests.
    pub fn for_testing() -> Self {
        Self {
            global_ready_timeout: "500ms".to_string(),
            per_cluster_ready_timeout: "200ms".to_string(),
            tick: "20ms".to_string(),
        }
    }

    pub fn global_ready_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.global_ready_timeout).unwrap_or(Duration::from_secs(600))
    }

    pub fn per_cluster_ready_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.per_cluster_ready_timeout)
            .unwrap_or(Duration::from_secs(15))
    }

    pub fn tick_duration(&self) -> Duration {
        humantime::parse_duration(&self.tick).unwrap_or(Duration::from_secs(5))
    }

    fn validate(&self) -> Result<()> {
        parse_duration_field("readiness.global_ready_timeout", &self.global_ready_timeout)?;
        parse_duration_field(
            "readiness.per_cluster_ready_timeout",
            &self.per_cluster_ready_timeout,
        )?;
        let tick = parse_duration_field("readiness.tick", &self.tick)?;
        if tick.is_zero() {
            return Err(MirrorError::Config(
                "readiness.tick must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LimitsConfig: event throughput and snapshot concurrency
// ═══════════════════════════════════════════════════════════════════════════════

/// Throughput and concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Sustained watch-event application rate per session (events/sec).
    #[serde(default = "default_events_per_sec")]
    pub events_per_sec: u32,

    /// Burst allowance above the sustained rate.
    #[serde(default = "default_event_burst")]
    pub event_burst: u32,

    /// Maximum number of clusters running their snapshot phase at once.
    #[serde(default = "default_snapshot_concurrency")]
    pub snapshot_concurrency: usize,
}

fn default_events_per_sec() -> u32 {
    5000
}

fn default_event_burst() -> u32 {
    500
}

fn default_snapshot_concurrency() -> usize {
    16
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            events_per_sec: 5000,
            event_burst: 500,
            snapshot_concurrency: 16,
        }
    }
}

impl LimitsConfig {
    /// Rate-limit configuration for one session's event application.
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            burst_size: self.event_burst,
            refill_rate: self.events_per_sec,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.events_per_sec == 0 || self.event_burst == 0 {
            return Err(MirrorError::Config(
                "limits.events_per_sec and limits.event_burst must be non-zero".to_string(),
            ));
        }
        if self.snapshot_concurrency == 0 {
            return Err(MirrorError::Config(
                "limits.snapshot_concurrency must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RemoteClusterConfig: one remote cluster
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity and endpoint of one remote cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteClusterConfig {
    /// Mesh-wide unique cluster name.
    pub name: String,

    /// Mesh-wide unique numeric id in `[1, max_connected_clusters]`.
    /// Also selects the cluster's identity partition.
    pub cluster_id: u32,

    /// Backend endpoint, e.g. `redis://paris:6379` or `mem://paris`.
    pub address: String,
}

impl RemoteClusterConfig {
    /// Create a cluster entry for testing.
    pub fn for_testing(name: &str, cluster_id: u32, address: &str) -> Self {
        Self {
            name: name.to_string(),
            cluster_id,
            address: address.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HeartbeatConfig: leased liveness key
// ═══════════════════════════════════════════════════════════════════════════════

/// Heartbeat publisher settings.
///
/// The heartbeat is a single leased key in the destination backend, renewed
/// on a period strictly shorter than the lease TTL. Consumers treat the
/// key's absence as "this aggregator is down".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Whether the heartbeat publisher runs at all.
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Destination backend endpoint the heartbeat is written to.
    #[serde(default)]
    pub address: String,

    /// Key prefix; the full key is `<prefix>/<cluster_name>`.
    #[serde(default = "default_heartbeat_key_prefix")]
    pub key_prefix: String,

    /// Lease TTL (humantime string).
    #[serde(default = "default_heartbeat_lease_ttl")]
    pub lease_ttl: String,

    /// Renewal period; must be strictly shorter than the TTL.
    #[serde(default = "default_heartbeat_period")]
    pub period: String,
}

fn default_false() -> bool {
    false
}

fn default_heartbeat_key_prefix() -> String {
    "mesh/heartbeats".to_string()
}

fn default_heartbeat_lease_ttl() -> String {
    "15m".to_string()
}

fn default_heartbeat_period() -> String {
    "1m".to_string()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            key_prefix: "mesh/heartbeats".to_string(),
            lease_ttl: "15m".to_string(),
            period: "1m".to_string(),
        }
    }
}

impl HeartbeatConfig {
    pub fn lease_ttl_duration(&self) -> Duration {
        humantime::parse_duration(&self.lease_ttl).unwrap_or(Duration::from_secs(900))
    }

    pub fn period_duration(&self) -> Duration {
        humantime::parse_duration(&self.period).unwrap_or(Duration::from_secs(60))
    }

    /// The full heartbeat key for this instance.
    pub fn key_for(&self, cluster_name: &str) -> String {
        format!("{}/{}", self.key_prefix, cluster_name)
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.address.is_empty() {
            return Err(MirrorError::Config(
                "heartbeat.enabled requires heartbeat.address".to_string(),
            ));
        }
        let ttl = parse_duration_field("heartbeat.lease_ttl", &self.lease_ttl)?;
        let period = parse_duration_field("heartbeat.period", &self.period)?;
        if period >= ttl {
            return Err(MirrorError::Config(format!(
                "heartbeat.period ({}) must be shorter than heartbeat.lease_ttl ({})",
                self.period, self.lease_ttl
            )));
        }
        Ok(())
    }
}

fn parse_duration_field(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| MirrorError::Config(format!("{}: invalid duration {:?}: {}", field, value, e)))
}
