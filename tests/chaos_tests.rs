// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests script exact failure sequences against in-memory backends and
//! verify the supervisor reacts the way it should: tolerate below-threshold
//! quorum errors, reconnect exactly once per threshold crossing, park
//! permanently on fatal errors, and never expose half-applied resyncs.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{ScriptedConnector, ScriptedMesh};
use mesh_mirror::backend::BackendError;
use mesh_mirror::config::{MirrorConfig, RemoteClusterConfig};
use mesh_mirror::registry::{RegistryState, RemoteClusterRegistry};
use mesh_mirror::session::SessionStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Poll until `check` passes or the deadline expires.
async fn wait_for(what: &str, deadline: Duration, mut check: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !check() {
        if start.elapsed() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

fn one_cluster_config() -> MirrorConfig {
    let mut config = MirrorConfig::for_testing("berlin");
    config.clusters = vec![RemoteClusterConfig::for_testing("paris", 2, "mem://paris")];
    config
}

// =============================================================================
// Quorum Error Storms
// =============================================================================

/// Test: crossing the consecutive-quorum-error threshold reconnects
/// exactly once, and a lone error reconnects not at all.
#[tokio::test]
async fn quorum_storm_triggers_exactly_one_reconnect() {
    let connector = Arc::new(ScriptedConnector::new());
    connector
        .store()
        .put("mesh/state/svc/a", b"1".to_vec())
        .unwrap();

    // for_testing trips after 2 consecutive quorum errors
    let mut registry =
        RemoteClusterRegistry::new(one_cluster_config(), connector.clone()).unwrap();
    registry.start().await.unwrap();

    let mirror = registry.mirror().clone();
    wait_for("initial sync", Duration::from_secs(5), || {
        mirror.cluster_len("paris") == 1
    })
    .await;
    assert_eq!(connector.connect_count(), 1);

    // A single quorum error is tolerated on the live connection.
    assert_eq!(
        connector.break_streams(BackendError::Quorum("1 of 3 voters reachable".into())),
        1
    );
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        connector.connect_count(),
        1,
        "a single quorum error must not reconnect"
    );

    // Traffic still flows, and the successful apply resets the streak.
    connector
        .store()
        .put("mesh/state/svc/b", b"2".to_vec())
        .unwrap();
    wait_for("event after tolerated error", Duration::from_secs(5), || {
        mirror.get("paris", "svc/b").is_some()
    })
    .await;

    // Two consecutive errors cross the threshold: one full reconnect.
    connector.break_streams(BackendError::Quorum("1 of 3 voters reachable".into()));
    connector.break_streams(BackendError::Quorum("1 of 3 voters reachable".into()));
    wait_for("reconnect after crossing", Duration::from_secs(5), || {
        connector.connect_count() == 2
    })
    .await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        connector.connect_count(),
        2,
        "exactly one reconnect per threshold crossing"
    );

    let session = registry.session("paris").unwrap();
    wait_for("session healthy again", Duration::from_secs(5), || {
        session.status() == SessionStatus::Ready
    })
    .await;

    // The next storm crosses again and costs exactly one more reconnect.
    connector.break_streams(BackendError::Quorum("1 of 3 voters reachable".into()));
    connector.break_streams(BackendError::Quorum("1 of 3 voters reachable".into()));
    wait_for("second reconnect", Duration::from_secs(5), || {
        connector.connect_count() == 3
    })
    .await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(connector.connect_count(), 3);

    println!(
        "storms handled with {} total connects",
        connector.connect_count()
    );
    registry.shutdown().await;
}

/// Test: storms below the threshold never reconnect, because a successful
/// apply in between resets the consecutive count.
#[tokio::test]
async fn below_threshold_storms_never_reconnect() {
    let connector = Arc::new(ScriptedConnector::new());
    connector
        .store()
        .put("mesh/state/svc/a", b"1".to_vec())
        .unwrap();

    let mut config = one_cluster_config();
    config.settings.supervisor.max_consecutive_quorum_errors = 3;

    let mut registry = RemoteClusterRegistry::new(config, connector.clone()).unwrap();
    registry.start().await.unwrap();

    let mirror = registry.mirror().clone();
    wait_for("initial sync", Duration::from_secs(5), || {
        mirror.cluster_len("paris") == 1
    })
    .await;
    let session = registry.session("paris").unwrap();

    // Two of three: tolerated.
    connector.break_streams(BackendError::Quorum("no quorum".into()));
    connector.break_streams(BackendError::Quorum("no quorum".into()));
    wait_for("both errors observed", Duration::from_secs(5), || {
        session.quorum_error_count() == 2
    })
    .await;
    assert_eq!(connector.connect_count(), 1);

    // A successful apply resets the streak.
    connector
        .store()
        .put("mesh/state/svc/b", b"2".to_vec())
        .unwrap();
    wait_for("success resets streak", Duration::from_secs(5), || {
        session.quorum_error_count() == 0
    })
    .await;

    // Two more: still tolerated. Four errors total, never three in a row.
    connector.break_streams(BackendError::Quorum("no quorum".into()));
    connector.break_streams(BackendError::Quorum("no quorum".into()));
    wait_for("second storm observed", Duration::from_secs(5), || {
        session.quorum_error_count() == 2
    })
    .await;
    sleep(Duration::from_millis(150)).await;
    assert_eq!(
        connector.connect_count(),
        1,
        "below-threshold storms must not reconnect"
    );
    assert_eq!(session.status(), SessionStatus::Ready);

    registry.shutdown().await;
}

// =============================================================================
// Connect Failures
// =============================================================================

/// Test: transient connect failures are retried with backoff until one
/// succeeds.
#[tokio::test]
async fn flaky_connects_eventually_sync() {
    let connector = Arc::new(ScriptedConnector::new());
    connector
        .store()
        .put("mesh/state/svc/a", b"1".to_vec())
        .unwrap();
    for _ in 0..3 {
        connector.fail_next_connect(BackendError::Transient("connection refused".into()));
    }

    let mut registry =
        RemoteClusterRegistry::new(one_cluster_config(), connector.clone()).unwrap();
    registry.start().await.unwrap();

    let readiness = registry.readiness().clone();
    wait_for("sync despite flaky connects", Duration::from_secs(5), || {
        readiness.is_cluster_ready("paris")
    })
    .await;

    assert_eq!(
        connector.connect_count(),
        4,
        "three refused attempts plus the one that stuck"
    );
    assert_eq!(
        registry.mirror().get("paris", "svc/a").as_deref(),
        Some(b"1".as_ref())
    );

    registry.shutdown().await;
}

/// Test: reconnect attempts have no cap. A cluster that never accepts
/// keeps being dialed until shutdown.
#[tokio::test]
async fn refused_connects_are_redialed_without_limit() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.refuse_connects(BackendError::Transient("connection refused".into()));

    let mut registry =
        RemoteClusterRegistry::new(one_cluster_config(), connector.clone()).unwrap();
    registry.start().await.unwrap();

    wait_for("attempts well past any plausible cap", Duration::from_secs(5), || {
        connector.connect_count() >= 5
    })
    .await;
    assert!(registry.is_running());
    assert!(!registry.readiness().is_cluster_ready("paris"));

    registry.shutdown().await;
}

// =============================================================================
// Fatal Errors
// =============================================================================

/// Test: a fatal connect error parks the session permanently without
/// touching the other clusters.
#[tokio::test]
async fn fatal_connect_error_degrades_only_that_cluster() {
    let mesh = Arc::new(ScriptedMesh::new());
    let paris = mesh.cluster("mem://paris");
    paris
        .store()
        .put("mesh/state/svc/a", b"1".to_vec())
        .unwrap();
    let tokyo = mesh.cluster("mem://tokyo");
    tokyo.fail_next_connect(BackendError::Auth("certificate rejected".into()));

    let mut config = MirrorConfig::for_testing("berlin");
    config.clusters = vec![
        RemoteClusterConfig::for_testing("paris", 2, "mem://paris"),
        RemoteClusterConfig::for_testing("tokyo", 3, "mem://tokyo"),
    ];

    let mut registry = RemoteClusterRegistry::new(config, mesh.clone()).unwrap();
    registry.start().await.unwrap();

    let tokyo_session = registry.session("tokyo").unwrap();
    wait_for("tokyo parked", Duration::from_secs(5), || {
        tokyo_session.status() == SessionStatus::Degraded
    })
    .await;
    assert!(tokyo_session.is_permanently_degraded());

    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        tokyo.connect_count(),
        1,
        "fatal connect errors must not be retried"
    );

    // The healthy cluster is unaffected.
    let mirror = registry.mirror().clone();
    wait_for("paris unaffected", Duration::from_secs(5), || {
        mirror.get("paris", "svc/a").is_some()
    })
    .await;
    paris
        .store()
        .put("mesh/state/svc/b", b"2".to_vec())
        .unwrap();
    wait_for("paris still live", Duration::from_secs(5), || {
        mirror.get("paris", "svc/b").is_some()
    })
    .await;
    assert_eq!(registry.state(), RegistryState::Running);

    registry.shutdown().await;
}

/// Test: a fatal error on the live stream degrades the session in place;
/// already-mirrored data stays readable.
#[tokio::test]
async fn fatal_stream_error_degrades_without_reconnect() {
    let connector = Arc::new(ScriptedConnector::new());
    connector
        .store()
        .put("mesh/state/svc/a", b"1".to_vec())
        .unwrap();

    let mut registry =
        RemoteClusterRegistry::new(one_cluster_config(), connector.clone()).unwrap();
    registry.start().await.unwrap();

    let mirror = registry.mirror().clone();
    wait_for("initial sync", Duration::from_secs(5), || {
        mirror.cluster_len("paris") == 1
    })
    .await;

    connector.break_streams(BackendError::Auth("token expired".into()));

    let session = registry.session("paris").unwrap();
    wait_for("session degraded", Duration::from_secs(5), || {
        session.status() == SessionStatus::Degraded
    })
    .await;
    assert!(session.is_permanently_degraded());

    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        connector.connect_count(),
        1,
        "a degraded session must stop reconnecting"
    );

    // Last-known-good data is still served.
    assert_eq!(mirror.get("paris", "svc/a").as_deref(), Some(b"1".as_ref()));

    registry.shutdown().await;
}

// =============================================================================
// Resync Consistency
// =============================================================================

/// Test: concurrent readers never observe surviving keys missing while
/// resync storms replay the snapshot.
#[tokio::test]
async fn readers_never_see_gaps_during_resync_storm() {
    let connector = Arc::new(ScriptedConnector::new());
    for i in 0..50u8 {
        connector
            .store()
            .put(&format!("mesh/state/entry/{:02}", i), vec![i])
            .unwrap();
    }

    let mut registry =
        RemoteClusterRegistry::new(one_cluster_config(), connector.clone()).unwrap();
    registry.start().await.unwrap();

    let mirror = registry.mirror().clone();
    wait_for("initial sync", Duration::from_secs(5), || {
        mirror.cluster_len("paris") == 50
    })
    .await;

    let reader_mirror = mirror.clone();
    let violations = Arc::new(AtomicUsize::new(0));
    let reader_violations = violations.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();
    let reader = tokio::spawn(async move {
        while !reader_stop.load(Ordering::Relaxed) {
            for i in 0..50u8 {
                if reader_mirror
                    .get("paris", &format!("entry/{:02}", i))
                    .is_none()
                {
                    reader_violations.fetch_add(1, Ordering::Relaxed);
                }
            }
            tokio::task::yield_now().await;
        }
    });

    // Every storm forces a snapshot replay on the same connection.
    for _ in 0..5 {
        connector.break_streams(BackendError::ResyncRequired("replay window overrun".into()));
        sleep(Duration::from_millis(50)).await;
    }

    let session = registry.session("paris").unwrap();
    wait_for("final resync settles", Duration::from_secs(5), || {
        session.status() == SessionStatus::Ready && mirror.cluster_len("paris") == 50
    })
    .await;

    stop.store(true, Ordering::Relaxed);
    reader.await.unwrap();

    assert_eq!(
        violations.load(Ordering::Relaxed),
        0,
        "resync must never drop surviving keys"
    );
    assert_eq!(
        connector.connect_count(),
        1,
        "resync happens on the existing connection"
    );

    registry.shutdown().await;
}

// =============================================================================
// Shutdown Under Fire
// =============================================================================

/// Test: shutdown interrupts reconnect backoff instead of waiting it out.
#[tokio::test]
async fn shutdown_during_reconnect_storm_is_prompt() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.refuse_connects(BackendError::Transient("cluster unreachable".into()));

    let mut registry =
        RemoteClusterRegistry::new(one_cluster_config(), connector.clone()).unwrap();
    registry.start().await.unwrap();

    wait_for("retry loop spinning", Duration::from_secs(5), || {
        connector.connect_count() >= 2
    })
    .await;

    let start = std::time::Instant::now();
    registry.shutdown().await;
    let elapsed = start.elapsed();

    assert_eq!(registry.state(), RegistryState::Stopped);
    assert!(
        elapsed < Duration::from_secs(2),
        "shutdown took {:?}, should interrupt backoff promptly",
        elapsed
    );
    println!("shutdown mid-storm took {:?}", elapsed);
}
