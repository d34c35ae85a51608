//! Liveness heartbeat: a leased key proving this instance is up.
//!
//! The publisher writes `<key_prefix>/<cluster_name>` to the destination
//! backend under a lease and renews it on a period strictly shorter than
//! the lease TTL. Liveness is carried by the key's existence: if this
//! process dies or loses connectivity for longer than the TTL, the lease
//! lapses and the key disappears on its own. Nothing here ever claims
//! liveness it cannot back: the success timestamp moves only after the
//! backend confirmed a create or renew, and a clean shutdown removes the
//! key instead of letting it linger until expiry.

use crate::backend::{BackendConnector, BackendError, BackendResult, KvBackend, LeaseHandle};
use crate::config::HeartbeatConfig;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// The JSON value stored under the heartbeat key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Name of the cluster this instance serves.
    pub cluster: String,
    /// RFC 3339 timestamp of when the current lease was created.
    pub since: String,
    pub pid: u32,
}

impl HeartbeatPayload {
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            since: Utc::now().to_rfc3339(),
            pid: std::process::id(),
        }
    }

    pub fn decode(bytes: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::MirrorError::Internal(format!("heartbeat payload: {e}")))
    }
}

struct HeartbeatState {
    last_success: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
}

/// Read-only view of the publisher's health, for health checks and tests.
#[derive(Clone)]
pub struct HeartbeatHandle {
    state: Arc<HeartbeatState>,
    ttl: Duration,
}

impl HeartbeatHandle {
    /// Time since the last confirmed write, if there ever was one.
    pub fn last_success_age(&self) -> Option<Duration> {
        let guard = match self.state.last_success.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.map(|at| at.elapsed())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Whether the published key can still be alive: a write was confirmed
    /// within the lease TTL.
    pub fn is_live(&self) -> bool {
        self.last_success_age()
            .map(|age| age < self.ttl)
            .unwrap_or(false)
    }
}

/// Publishes and maintains the leased heartbeat key.
pub struct HeartbeatPublisher {
    config: HeartbeatConfig,
    key: String,
    cluster_name: String,
    connector: Arc<dyn BackendConnector>,
    state: Arc<HeartbeatState>,
}

impl HeartbeatPublisher {
    pub fn new(
        cluster_name: &str,
        config: HeartbeatConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        let key = config.key_for(cluster_name);
        Self {
            config,
            key,
            cluster_name: cluster_name.to_string(),
            connector,
            state: Arc::new(HeartbeatState {
                last_success: Mutex::new(None),
                consecutive_failures: AtomicU32::new(0),
            }),
        }
    }

    pub fn handle(&self) -> HeartbeatHandle {
        HeartbeatHandle {
            state: self.state.clone(),
            ttl: self.config.lease_ttl_duration(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Beat until shutdown. The first beat happens immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.period_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            key = %self.key,
            period = %self.config.period,
            ttl = %self.config.lease_ttl,
            "heartbeat publisher started"
        );

        let mut backend: Option<Arc<dyn KvBackend>> = None;
        let mut lease: Option<LeaseHandle> = None;

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.beat(&mut backend, &mut lease).await;
                }
            }
        }

        // Deliberate shutdown: take the key down now rather than letting
        // consumers wait out the TTL.
        if let Some(backend) = backend {
            let _ = timeout(CLEANUP_TIMEOUT, async {
                if let Err(e) = backend.delete(&self.key).await {
                    debug!(key = %self.key, "removing heartbeat key: {e}");
                }
                let _ = backend.close().await;
            })
            .await;
        }
        info!(key = %self.key, "heartbeat publisher stopped");
    }

    async fn beat(
        &self,
        backend: &mut Option<Arc<dyn KvBackend>>,
        lease: &mut Option<LeaseHandle>,
    ) {
        match self.try_beat(backend, lease).await {
            Ok(()) => {
                crate::metrics::record_heartbeat(true);
                self.state.consecutive_failures.store(0, Ordering::SeqCst);
                let mut guard = match self.state.last_success.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *guard = Some(Instant::now());
            }
            Err(e) => {
                crate::metrics::record_heartbeat(false);
                let failures = self
                    .state
                    .consecutive_failures
                    .fetch_add(1, Ordering::SeqCst)
                    + 1;
                warn!(key = %self.key, failures, "heartbeat failed: {e}");
                // Start from a fresh connection and lease next period
                if let Some(dead) = backend.take() {
                    let _ = dead.close().await;
                }
                *lease = None;
            }
        }
    }

    async fn try_beat(
        &self,
        backend: &mut Option<Arc<dyn KvBackend>>,
        lease: &mut Option<LeaseHandle>,
    ) -> BackendResult<()> {
        let conn = match backend.as_ref() {
            Some(conn) => conn.clone(),
            None => {
                let connected = timeout(
                    CONNECT_TIMEOUT,
                    self.connector.connect(&self.config.address),
                )
                .await
                .map_err(|_| BackendError::Transient("heartbeat connect timed out".into()))??;
                *backend = Some(connected.clone());
                connected
            }
        };

        match lease.as_ref() {
            Some(current) => match conn.renew_lease(current).await {
                Ok(()) => Ok(()),
                Err(BackendError::NotFound(_)) => {
                    // The lease lapsed while we could not reach the
                    // backend; publish a fresh one.
                    debug!(key = %self.key, "lease lapsed, re-publishing");
                    *lease = Some(self.publish(&conn).await?);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => {
                *lease = Some(self.publish(&conn).await?);
                Ok(())
            }
        }
    }

    async fn publish(&self, conn: &Arc<dyn KvBackend>) -> BackendResult<LeaseHandle> {
        let payload = serde_json::to_vec(&HeartbeatPayload::new(&self.cluster_name))
            .map_err(|e| BackendError::Fatal(format!("encode heartbeat payload: {e}")))?;
        conn.put_with_lease(&self.key, payload, self.config.lease_ttl_duration())
            .await
    }
}
