//! Session driver: one task per remote cluster.
//!
//! Each remote cluster has a dedicated task that:
//! 1. Connects to the cluster's backend, with jittered exponential backoff
//! 2. Runs the initial sync (watch first, then snapshot, then sweep)
//! 3. Tails the watch subscription and applies events to the mirror
//! 4. Rebuilds the connection when the stream fails, resuming from the
//!    last cursor when the backend supports it
//!
//! # Graceful Shutdown
//!
//! Every await that can block for long (backoff sleeps, watch reads,
//! snapshot fetches) is raced against the shutdown signal via
//! `tokio::select!`, so the task exits promptly when the registry shuts
//! down. The registry closes the session afterwards, which tears down the
//! backend connection.
//!
//! # Quorum Containment
//!
//! Quorum errors reported by the backend are tolerated until the session's
//! threshold of consecutive failures is reached. Crossing the threshold
//! tears the connection down and rebuilds it exactly once; the counter
//! resets on any successful operation and on every fresh connection. No
//! error on one cluster's session ever touches another cluster.

use crate::backend::{BackendConnector, BackendError, KvBackend, KvEventKind, WatchSubscription};
use crate::metrics;
use crate::mirror::{ApplyOutcome, MirrorEvent, MirrorStore};
use crate::readiness::ReadinessTracker;
use crate::resilience::{Bulkhead, RateLimiter, RetryConfig};
use crate::session::{RemoteClusterSession, SessionStatus};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// How one sync attempt on a live connection ended.
enum SyncOutcome {
    /// Initial sync complete; the subscription is ready to drain.
    Synced(WatchSubscription),
    /// The backend rejected the resume cursor; run a full sync on the
    /// same connection.
    FullSyncRequired,
    /// The connection is unusable; rebuild it from scratch.
    Reconnect,
    /// The session was marked permanently degraded; stop reconnecting.
    Fatal,
    /// Shutdown signal observed.
    Shutdown,
}

/// Why the drain loop handed control back.
enum DrainOutcome {
    /// The backend demands a fresh snapshot on the live connection.
    Resync,
    /// The connection is unusable; rebuild it from scratch.
    Reconnect,
    /// The session was marked permanently degraded; stop reconnecting.
    Fatal,
    /// Shutdown signal observed.
    Shutdown,
}

/// Run the session for a single remote cluster until shutdown, permanent
/// degradation, or close.
///
/// # Resume vs Full Sync
///
/// After a disconnect the task resumes from the last applied cursor when
/// the backend supports resumption and a cursor exists. The backend is
/// the authority: if it cannot replay from that cursor it rejects the
/// resume, and the task falls back to a full sync. A full sync announces
/// a snapshot reset to the mirror, so entries that survive the resync are
/// never transiently deleted.
///
/// # Backoff
///
/// Failed connection attempts back off exponentially with jitter and no
/// retry limit. The attempt counter resets once a sync completes, so the
/// first reconnect after a healthy period is immediate.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_session(
    session: Arc<RemoteClusterSession>,
    mirror: Arc<MirrorStore>,
    readiness: Arc<ReadinessTracker>,
    connector: Arc<dyn BackendConnector>,
    retry: RetryConfig,
    limiter: Arc<RateLimiter>,
    snapshots: Arc<Bulkhead>,
    remote_prefix: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let cluster = session.cluster_name().to_string();
    let span = tracing::info_span!("session", cluster = %cluster);

    async move {
        info!(address = %session.address(), "Starting remote cluster session");

        // Waking on status changes lets a long backoff sleep notice
        // session.close() immediately
        let mut status_rx = session.subscribe_status();
        let mut attempt: usize = 0;

        'reconnect: loop {
            if session.is_closed() || session.is_permanently_degraded() {
                break;
            }

            if attempt > 0 {
                let delay = retry.jittered_delay_for_attempt(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before reconnect"
                );
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break 'reconnect;
                        }
                    }
                    _ = status_rx.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                if session.is_closed() {
                    break;
                }
            }
            attempt += 1;
            session.set_status(SessionStatus::Connecting);

            let backend = match tokio::time::timeout(
                retry.connection_timeout,
                connector.connect(session.address()),
            )
            .await
            {
                Ok(Ok(backend)) => backend,
                Ok(Err(e)) if e.is_fatal() => {
                    metrics::record_connect_attempt(&cluster, false);
                    error!(error = %e, "Connection rejected, giving up on this cluster");
                    session.mark_permanently_degraded(&e.to_string());
                    break 'reconnect;
                }
                Ok(Err(e)) => {
                    metrics::record_connect_attempt(&cluster, false);
                    if e.is_quorum() {
                        metrics::record_quorum_error(&cluster);
                        session.record_quorum_error();
                    }
                    warn!(error = %e, attempt, "Connection failed");
                    continue 'reconnect;
                }
                Err(_) => {
                    metrics::record_connect_attempt(&cluster, false);
                    warn!(
                        attempt,
                        timeout_ms = retry.connection_timeout.as_millis() as u64,
                        "Connection timed out"
                    );
                    continue 'reconnect;
                }
            };
            metrics::record_connect_attempt(&cluster, true);
            session.install_backend(backend.clone()).await;

            let mut force_full = !session.can_resume();
            'connected: loop {
                let sync = if force_full {
                    full_sync(
                        &session,
                        &mirror,
                        &readiness,
                        &cluster,
                        &backend,
                        &limiter,
                        &snapshots,
                        &remote_prefix,
                        &mut shutdown_rx,
                    )
                    .await
                } else {
                    resume(
                        &session,
                        &readiness,
                        &cluster,
                        &backend,
                        &remote_prefix,
                        &mut shutdown_rx,
                    )
                    .await
                };

                let mut subscription = match sync {
                    SyncOutcome::Synced(subscription) => subscription,
                    SyncOutcome::FullSyncRequired => {
                        force_full = true;
                        continue 'connected;
                    }
                    SyncOutcome::Reconnect => {
                        session.set_status(SessionStatus::Degraded);
                        metrics::record_reconnect(&cluster);
                        teardown(&session).await;
                        continue 'reconnect;
                    }
                    SyncOutcome::Fatal => {
                        teardown(&session).await;
                        break 'reconnect;
                    }
                    SyncOutcome::Shutdown => break 'reconnect,
                };
                attempt = 0;

                match drain(
                    &session,
                    &mirror,
                    &cluster,
                    &limiter,
                    &remote_prefix,
                    &mut subscription,
                    &mut shutdown_rx,
                )
                .await
                {
                    DrainOutcome::Resync => {
                        force_full = true;
                        continue 'connected;
                    }
                    DrainOutcome::Reconnect => {
                        session.set_status(SessionStatus::Degraded);
                        metrics::record_reconnect(&cluster);
                        teardown(&session).await;
                        continue 'reconnect;
                    }
                    DrainOutcome::Fatal => {
                        teardown(&session).await;
                        break 'reconnect;
                    }
                    DrainOutcome::Shutdown => break 'reconnect,
                }
            }
        }

        if session.is_permanently_degraded() {
            metrics::record_session_degraded(&cluster);
        }
        info!("Remote cluster session stopped");
    }
    .instrument(span)
    .await
}

/// Full sync: watch first so nothing written during the snapshot is
/// missed, then snapshot, then sweep stale entries. Events that arrive on
/// the subscription for keys already in the snapshot re-apply as
/// unchanged upserts.
#[allow(clippy::too_many_arguments)]
async fn full_sync(
    session: &RemoteClusterSession,
    mirror: &MirrorStore,
    readiness: &ReadinessTracker,
    cluster: &str,
    backend: &Arc<dyn KvBackend>,
    limiter: &RateLimiter,
    snapshots: &Bulkhead,
    remote_prefix: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SyncOutcome {
    session.set_status(SessionStatus::Syncing);
    // The old cursor belongs to a stream this sync replaces
    session.clear_cursor();

    let subscription = tokio::select! {
        biased;
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                return SyncOutcome::Shutdown;
            }
            return SyncOutcome::Reconnect;
        }
        result = backend.watch(remote_prefix, None) => match result {
            Ok(subscription) => subscription,
            Err(e) => return failure_outcome(session, cluster, "watch", e),
        }
    };
    session.set_resumable(subscription.resumable());

    // Bound how many snapshots are in flight across all sessions
    let _permit = snapshots.acquire().await.ok();

    let started = Instant::now();
    let snapshot = tokio::select! {
        biased;
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                return SyncOutcome::Shutdown;
            }
            return SyncOutcome::Reconnect;
        }
        result = backend.snapshot(remote_prefix) => match result {
            Ok(snapshot) => snapshot,
            Err(e) => return failure_outcome(session, cluster, "snapshot", e),
        }
    };

    mirror.apply(cluster, MirrorEvent::SnapshotReset);
    let mut applied = 0usize;
    for pair in snapshot.pairs {
        limiter.acquire().await;
        let Some(key) = relative_key(remote_prefix, &pair.key) else {
            debug!(key = %pair.key, "Snapshot key outside watched prefix, skipping");
            continue;
        };
        mirror.apply(cluster, MirrorEvent::Upsert { key, value: pair.value });
        session.record_event_applied();
        applied += 1;
    }
    let swept = match mirror.apply(cluster, MirrorEvent::SnapshotComplete) {
        ApplyOutcome::ResyncCompleted { swept } => swept,
        _ => 0,
    };
    metrics::record_snapshot_sync(cluster, applied, swept, started.elapsed());
    info!(
        entries = applied,
        swept,
        duration_ms = started.elapsed().as_millis() as u64,
        "Initial sync complete"
    );

    session.record_quorum_success();
    readiness.mark_synced(cluster);
    session.set_status(SessionStatus::Ready);
    SyncOutcome::Synced(subscription)
}

/// Resume from the last applied cursor, skipping the snapshot. The
/// backend rejects the cursor when it cannot replay every missed event,
/// in which case the caller falls back to a full sync.
async fn resume(
    session: &RemoteClusterSession,
    readiness: &ReadinessTracker,
    cluster: &str,
    backend: &Arc<dyn KvBackend>,
    remote_prefix: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SyncOutcome {
    let cursor = session.cursor();
    session.set_status(SessionStatus::Syncing);

    let subscription = tokio::select! {
        biased;
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                return SyncOutcome::Shutdown;
            }
            return SyncOutcome::Reconnect;
        }
        result = backend.watch(remote_prefix, cursor.clone()) => match result {
            Ok(subscription) => subscription,
            Err(e) if e.is_resync_required() => {
                info!(
                    cursor = cursor.as_deref().unwrap_or(""),
                    "Resume cursor rejected, falling back to full sync"
                );
                metrics::record_resync_fallback(cluster);
                return SyncOutcome::FullSyncRequired;
            }
            Err(e) => return failure_outcome(session, cluster, "watch", e),
        }
    };
    session.set_resumable(subscription.resumable());
    session.record_quorum_success();

    info!(
        cursor = cursor.as_deref().unwrap_or(""),
        "Resumed from cursor without snapshot"
    );
    readiness.mark_synced(cluster);
    session.set_status(SessionStatus::Ready);
    SyncOutcome::Synced(subscription)
}

/// Apply watch events until the stream fails, demands a resync, or
/// shutdown is signaled.
async fn drain(
    session: &RemoteClusterSession,
    mirror: &MirrorStore,
    cluster: &str,
    limiter: &RateLimiter,
    remote_prefix: &str,
    subscription: &mut WatchSubscription,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> DrainOutcome {
    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return DrainOutcome::Shutdown;
                }
            }
            event = subscription.recv() => match event {
                Some(Ok(event)) => {
                    limiter.acquire().await;
                    match event.kind {
                        KvEventKind::Upsert { key, value } => {
                            if let Some(key) = relative_key(remote_prefix, &key) {
                                let outcome =
                                    mirror.apply(cluster, MirrorEvent::Upsert { key, value });
                                metrics::record_event_applied(cluster, &outcome);
                            } else {
                                debug!(key = %key, "Event outside watched prefix, skipping");
                            }
                        }
                        KvEventKind::Delete { key } => {
                            if let Some(key) = relative_key(remote_prefix, &key) {
                                let outcome = mirror.apply(cluster, MirrorEvent::Delete { key });
                                metrics::record_event_applied(cluster, &outcome);
                            } else {
                                debug!(key = %key, "Event outside watched prefix, skipping");
                            }
                        }
                    }
                    if event.cursor.is_some() {
                        session.set_cursor(event.cursor);
                    }
                    session.record_event_applied();
                    session.record_quorum_success();
                }
                Some(Err(e)) if e.is_resync_required() => {
                    info!("Backend demands a full resync");
                    metrics::record_resync_fallback(cluster);
                    return DrainOutcome::Resync;
                }
                Some(Err(e)) if e.is_fatal() => {
                    error!(error = %e, "Unrecoverable error on watch stream");
                    session.mark_permanently_degraded(&e.to_string());
                    return DrainOutcome::Fatal;
                }
                Some(Err(e)) if e.is_quorum() => {
                    metrics::record_quorum_error(cluster);
                    if session.record_quorum_error() {
                        warn!(
                            error = %e,
                            consecutive = session.quorum_error_count(),
                            "Quorum error threshold crossed, rebuilding connection"
                        );
                        return DrainOutcome::Reconnect;
                    }
                    warn!(
                        error = %e,
                        consecutive = session.quorum_error_count(),
                        "Quorum error tolerated"
                    );
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Watch stream error, reconnecting");
                    return DrainOutcome::Reconnect;
                }
                None => {
                    if session.is_closed() {
                        return DrainOutcome::Shutdown;
                    }
                    warn!("Watch stream ended, reconnecting");
                    return DrainOutcome::Reconnect;
                }
            }
        }
    }
}

/// Map a failed backend operation during sync to what the session does
/// next. Fatal errors latch permanent degradation; everything else asks
/// for a fresh connection, with quorum failures counted on the way out.
fn failure_outcome(
    session: &RemoteClusterSession,
    cluster: &str,
    operation: &str,
    e: BackendError,
) -> SyncOutcome {
    if e.is_fatal() {
        error!(error = %e, operation, "Unrecoverable error during sync");
        session.mark_permanently_degraded(&e.to_string());
        return SyncOutcome::Fatal;
    }
    if e.is_quorum() {
        metrics::record_quorum_error(cluster);
        session.record_quorum_error();
    }
    warn!(error = %e, operation, "Sync failed, reconnecting");
    SyncOutcome::Reconnect
}

/// Close the session's current backend connection, if any.
async fn teardown(session: &RemoteClusterSession) {
    if let Some(backend) = session.take_backend().await {
        if let Err(e) = backend.close().await {
            debug!("closing torn down connection: {e}");
        }
    }
}

/// Strip the watched prefix from an absolute remote key. Returns `None`
/// for keys outside the prefix.
fn relative_key(prefix: &str, key: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryConnector;
    use crate::config::{ReadinessConfig, RemoteClusterConfig, SupervisorConfig};
    use crate::partition::{ClusterCapacity, IdentityPartition};
    use crate::resilience::RateLimitConfig;
    use std::time::Duration;

    fn test_session(name: &str, address: &str) -> Arc<RemoteClusterSession> {
        let config = RemoteClusterConfig::for_testing(name, 2, address);
        let partition =
            IdentityPartition::allocate(config.cluster_id, ClusterCapacity::Standard).unwrap();
        Arc::new(RemoteClusterSession::new(config, partition, 2))
    }

    fn spawn_task(
        session: Arc<RemoteClusterSession>,
        mirror: Arc<MirrorStore>,
        readiness: Arc<ReadinessTracker>,
        connector: Arc<MemoryConnector>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run_session(
            session,
            mirror,
            readiness,
            connector,
            SupervisorConfig::for_testing().retry_config(),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            Arc::new(Bulkhead::for_snapshots()),
            "mesh/state".to_string(),
            shutdown_rx,
        ))
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
        let start = Instant::now();
        while !check() {
            if start.elapsed() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ════════════════════════════════════════════════════════════════════
    // Helper tests
    // ════════════════════════════════════════════════════════════════════

    #[test]
    fn test_relative_key_strips_prefix() {
        assert_eq!(
            relative_key("mesh/state", "mesh/state/services/web"),
            Some("services/web".to_string())
        );
    }

    #[test]
    fn test_relative_key_rejects_foreign_keys() {
        assert_eq!(relative_key("mesh/state", "other/services/web"), None);
        assert_eq!(relative_key("mesh/state", "mesh/state"), None);
        assert_eq!(relative_key("mesh/state", "mesh/state/"), None);
    }

    // ════════════════════════════════════════════════════════════════════
    // Driver tests against the in-memory backend
    // ════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_full_sync_then_live_events() {
        let connector = Arc::new(MemoryConnector::new());
        let store = connector.store("mem://paris");
        store
            .put("mesh/state/services/web", b"10.0.0.1".to_vec())
            .unwrap();
        store
            .put("mesh/state/services/db", b"10.0.0.2".to_vec())
            .unwrap();

        let session = test_session("paris", "mem://paris");
        let mirror = Arc::new(MirrorStore::new("mesh/cache"));
        let readiness = Arc::new(ReadinessTracker::new(&ReadinessConfig::for_testing()));
        readiness.register_cluster("paris");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_task(
            session.clone(),
            mirror.clone(),
            readiness.clone(),
            connector,
            shutdown_rx,
        );

        {
            let mirror = mirror.clone();
            wait_for("initial sync", Duration::from_secs(2), || {
                mirror.cluster_len("paris") == 2
            })
            .await;
        }
        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(readiness.is_cluster_ready("paris"));
        assert_eq!(
            mirror.get("paris", "services/web").as_deref(),
            Some(b"10.0.0.1".as_slice())
        );

        // Live updates flow through the watch subscription
        store
            .put("mesh/state/services/cache", b"10.0.0.3".to_vec())
            .unwrap();
        store.delete("mesh/state/services/db").unwrap();
        {
            let mirror = mirror.clone();
            wait_for("live events", Duration::from_secs(2), || {
                mirror.get("paris", "services/cache").is_some()
                    && mirror.get("paris", "services/db").is_none()
            })
            .await;
        }
        assert!(session.events_applied() >= 4);
        assert!(session.cursor().is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_exits_promptly_while_idle() {
        let connector = Arc::new(MemoryConnector::new());
        connector.store("mem://paris");

        let session = test_session("paris", "mem://paris");
        let mirror = Arc::new(MirrorStore::new("mesh/cache"));
        let readiness = Arc::new(ReadinessTracker::new(&ReadinessConfig::for_testing()));
        readiness.register_cluster("paris");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_task(session.clone(), mirror, readiness, connector, shutdown_rx);

        {
            let session = session.clone();
            wait_for("session ready", Duration::from_secs(2), || {
                session.status() == SessionStatus::Ready
            })
            .await;
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task should exit on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_backend_triggers_reconnect_and_resume() {
        let connector = Arc::new(MemoryConnector::new());
        let store = connector.store("mem://paris");
        store.put("mesh/state/a", b"1".to_vec()).unwrap();

        let session = test_session("paris", "mem://paris");
        let mirror = Arc::new(MirrorStore::new("mesh/cache"));
        let readiness = Arc::new(ReadinessTracker::new(&ReadinessConfig::for_testing()));
        readiness.register_cluster("paris");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_task(
            session.clone(),
            mirror.clone(),
            readiness.clone(),
            connector,
            shutdown_rx,
        );

        // One live event after the initial sync leaves a resume cursor
        {
            let session = session.clone();
            wait_for("first sync", Duration::from_secs(2), || {
                session.status() == SessionStatus::Ready
            })
            .await;
        }
        store.put("mesh/state/live", b"x".to_vec()).unwrap();
        {
            let session = session.clone();
            wait_for("cursor recorded", Duration::from_secs(2), || {
                session.cursor().is_some()
            })
            .await;
        }

        // Kill the connection out from under the session; the task must
        // reconnect on its own and keep mirroring.
        if let Some(backend) = session.current_backend().await {
            backend.close().await.unwrap();
        }
        store.put("mesh/state/b", b"2".to_vec()).unwrap();
        {
            let mirror = mirror.clone();
            wait_for("reconnect picks up writes", Duration::from_secs(3), || {
                mirror.get("paris", "b").is_some()
            })
            .await;
        }
        assert_eq!(session.status(), SessionStatus::Ready);
        // Resume replays only the missed event; a full resync would have
        // re-applied the whole keyspace.
        assert_eq!(session.events_applied(), 3);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
