// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scriptable in-memory backend for failure injection.
//!
//! [`ScriptedConnector`] hands out connections to one shared
//! [`MemoryStore`], consuming planned failures in order. Tests script exact
//! failure sequences (refused connects, failed snapshots, broken watch
//! streams) without a network and then assert how the registry reacts.

use mesh_mirror::backend::memory::{MemoryBackend, MemoryStore};
use mesh_mirror::backend::{
    BackendConnector, BackendError, BoxFuture, KvBackend, LeaseHandle, Snapshot,
    WatchSubscription,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Failures waiting to be served, consumed front to back.
#[derive(Default)]
struct FailurePlan {
    connect: Mutex<VecDeque<BackendError>>,
    snapshot: Mutex<VecDeque<BackendError>>,
    watch: Mutex<VecDeque<BackendError>>,
    /// When set, every connect fails with a clone of this error.
    refuse: Mutex<Option<BackendError>>,
    /// Injection handles into live watch streams.
    taps: Mutex<Vec<mpsc::UnboundedSender<BackendError>>>,
}

impl FailurePlan {
    fn pop(queue: &Mutex<VecDeque<BackendError>>) -> Option<BackendError> {
        queue.lock().unwrap().pop_front()
    }

    fn push(queue: &Mutex<VecDeque<BackendError>>, error: BackendError) {
        queue.lock().unwrap().push_back(error);
    }
}

/// Connector whose every connection shares one in-memory store.
///
/// Seed data through [`store`](Self::store) before or while sessions run,
/// script failures with the `fail_next_*` methods, and break live watch
/// streams mid-flight with [`break_streams`](Self::break_streams).
pub struct ScriptedConnector {
    store: Arc<MemoryStore>,
    plan: Arc<FailurePlan>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            plan: Arc::new(FailurePlan::default()),
            connects: AtomicUsize::new(0),
        }
    }

    /// The store behind every connection this connector hands out.
    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// How many times `connect` was called, planned failures included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Fail the next `connect` call with `error`.
    pub fn fail_next_connect(&self, error: BackendError) {
        FailurePlan::push(&self.plan.connect, error);
    }

    /// Refuse every connect from now on with a clone of `error`.
    pub fn refuse_connects(&self, error: BackendError) {
        *self.plan.refuse.lock().unwrap() = Some(error);
    }

    /// Let connects succeed again after [`refuse_connects`](Self::refuse_connects).
    pub fn allow_connects(&self) {
        *self.plan.refuse.lock().unwrap() = None;
    }

    /// Fail the next `snapshot` call on any live connection.
    pub fn fail_next_snapshot(&self, error: BackendError) {
        FailurePlan::push(&self.plan.snapshot, error);
    }

    /// Fail the next `watch` call on any live connection.
    pub fn fail_next_watch(&self, error: BackendError) {
        FailurePlan::push(&self.plan.watch, error);
    }

    /// Push `error` into every live watch stream. Returns how many streams
    /// received it.
    pub fn break_streams(&self, error: BackendError) -> usize {
        let mut taps = self.plan.taps.lock().unwrap();
        taps.retain(|tap| tap.send(error.clone()).is_ok());
        taps.len()
    }
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendConnector for ScriptedConnector {
    fn connect<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, Arc<dyn KvBackend>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = FailurePlan::pop(&self.plan.connect) {
                return Err(error);
            }
            if let Some(error) = self.plan.refuse.lock().unwrap().clone() {
                return Err(error);
            }
            let backend: Arc<dyn KvBackend> = Arc::new(ScriptedBackend {
                inner: MemoryBackend::new(self.store.clone()),
                plan: self.plan.clone(),
            });
            Ok(backend)
        })
    }
}

/// Routes each address to its own [`ScriptedConnector`].
///
/// Lets multi-cluster registry tests script one cluster's failures without
/// touching the others.
#[derive(Default)]
pub struct ScriptedMesh {
    clusters: dashmap::DashMap<String, Arc<ScriptedConnector>>,
}

impl ScriptedMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// The connector behind an address, created on first use.
    pub fn cluster(&self, address: &str) -> Arc<ScriptedConnector> {
        self.clusters
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(ScriptedConnector::new()))
            .clone()
    }
}

impl BackendConnector for ScriptedMesh {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Arc<dyn KvBackend>> {
        let connector = self.cluster(address);
        Box::pin(async move { connector.connect(address).await })
    }
}

/// Connection that delegates to [`MemoryBackend`] after consulting the plan.
///
/// Watch subscriptions are re-wrapped through a forwarder task so errors can
/// be injected into them while the session is draining events.
struct ScriptedBackend {
    inner: MemoryBackend,
    plan: Arc<FailurePlan>,
}

impl KvBackend for ScriptedBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Vec<u8>> {
        self.inner.get(key)
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ()> {
        self.inner.put(key, value)
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        self.inner.delete(key)
    }

    fn snapshot<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Snapshot> {
        Box::pin(async move {
            if let Some(error) = FailurePlan::pop(&self.plan.snapshot) {
                return Err(error);
            }
            self.inner.snapshot(prefix).await
        })
    }

    fn watch<'a>(
        &'a self,
        prefix: &'a str,
        cursor: Option<String>,
    ) -> BoxFuture<'a, WatchSubscription> {
        Box::pin(async move {
            if let Some(error) = FailurePlan::pop(&self.plan.watch) {
                return Err(error);
            }
            let mut upstream = self.inner.watch(prefix, cursor).await?;
            let resumable = upstream.resumable();

            let (tx, rx) = mpsc::channel(64);
            let (inject_tx, mut inject_rx) = mpsc::unbounded_channel();
            self.plan.taps.lock().unwrap().push(inject_tx);

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        injected = inject_rx.recv() => {
                            let Some(error) = injected else { break };
                            if tx.send(Err(error)).await.is_err() {
                                break;
                            }
                        }
                        event = upstream.recv() => {
                            let Some(event) = event else { break };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            Ok(WatchSubscription::new(resumable, rx))
        })
    }

    fn put_with_lease<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, LeaseHandle> {
        self.inner.put_with_lease(key, value, ttl)
    }

    fn renew_lease<'a>(&'a self, lease: &'a LeaseHandle) -> BoxFuture<'a, ()> {
        self.inner.renew_lease(lease)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.inner.close()
    }
}
