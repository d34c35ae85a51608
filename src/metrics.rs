//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Session connection churn and quorum errors
//! - Snapshot syncs and event application
//! - Mirror size and readiness
//! - Registry lifecycle state
//! - Heartbeat publishing
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mirror_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use mesh_mirror::metrics;
//! use std::time::Duration;
//!
//! // In the session task after the initial sync
//! metrics::record_snapshot_sync("paris", 1200, 3, Duration::from_millis(250));
//!
//! // On a failed connection attempt
//! metrics::record_connect_attempt("paris", false);
//! ```

use crate::mirror::ApplyOutcome;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a connection attempt to a remote cluster's backend.
pub fn record_connect_attempt(cluster: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("mirror_connect_attempts_total", "cluster" => cluster.to_string(), "status" => status).increment(1);
}

/// Record a connection teardown followed by a rebuild.
pub fn record_reconnect(cluster: &str) {
    counter!("mirror_reconnects_total", "cluster" => cluster.to_string()).increment(1);
}

/// Record a quorum error reported by a remote backend.
pub fn record_quorum_error(cluster: &str) {
    counter!("mirror_quorum_errors_total", "cluster" => cluster.to_string()).increment(1);
}

/// Record a resume rejected by the backend, forcing a full resync.
pub fn record_resync_fallback(cluster: &str) {
    counter!("mirror_resync_fallbacks_total", "cluster" => cluster.to_string()).increment(1);
}

/// Record a completed snapshot sync with its sweep stats.
pub fn record_snapshot_sync(cluster: &str, entries: usize, swept: usize, duration: Duration) {
    let cluster = cluster.to_string();

    counter!("mirror_snapshot_syncs_total", "cluster" => cluster.clone()).increment(1);
    counter!("mirror_snapshot_entries_total", "cluster" => cluster.clone())
        .increment(entries as u64);
    if swept > 0 {
        counter!("mirror_snapshot_swept_total", "cluster" => cluster.clone())
            .increment(swept as u64);
    }

    histogram!("mirror_snapshot_sync_duration_seconds", "cluster" => cluster.clone())
        .record(duration.as_secs_f64());
    histogram!("mirror_snapshot_size", "cluster" => cluster).record(entries as f64);
}

/// Record one event applied to the mirror, labeled by what it did.
pub fn record_event_applied(cluster: &str, outcome: &ApplyOutcome) {
    counter!(
        "mirror_events_applied_total",
        "cluster" => cluster.to_string(),
        "outcome" => outcome_label(outcome)
    )
    .increment(1);
}

fn outcome_label(outcome: &ApplyOutcome) -> &'static str {
    match outcome {
        ApplyOutcome::Upserted => "upserted",
        ApplyOutcome::Unchanged => "unchanged",
        ApplyOutcome::Deleted => "deleted",
        ApplyOutcome::Absent => "absent",
        ApplyOutcome::ResyncStarted => "resync_started",
        ApplyOutcome::ResyncCompleted { .. } => "resync_completed",
    }
}

/// Record a session latching into permanent degradation.
pub fn record_session_degraded(cluster: &str) {
    counter!("mirror_sessions_degraded_total", "cluster" => cluster.to_string()).increment(1);
}

/// Record a heartbeat publish attempt.
pub fn record_heartbeat(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("mirror_heartbeats_total", "status" => status).increment(1);
}

/// Gauge for number of live sessions.
pub fn set_session_count(count: usize) {
    gauge!("mirror_sessions").set(count as f64);
}

/// Gauge for total mirrored entries across all clusters.
pub fn set_mirror_entries(entries: usize) {
    gauge!("mirror_entries").set(entries as f64);
}

/// Gauge for global readiness (1 = ready).
pub fn set_ready(ready: bool) {
    gauge!("mirror_ready").set(if ready { 1.0 } else { 0.0 });
}

/// Gauge for registry state.
pub fn set_registry_state(state: &str) {
    // Encode state as numeric for alerting (0=created, 2=running, 5=failed)
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("mirror_registry_state").set(value);
}
