//! In-process backend with full watch-resume semantics.
//!
//! [`MemoryStore`] models one remote cluster's store: entries, a bounded
//! revision log for cursor replay, leases, and live watchers. A
//! [`MemoryBackend`] is one connection to a store; dropping the connection
//! leaves the store's data intact, which is what lets tests exercise
//! disconnect, resume, and resync paths deterministically.

use super::{
    BackendConnector, BackendError, BackendResult, BoxFuture, KvBackend, KvEvent, KvEventKind,
    KvPair, LeaseHandle, Snapshot, WatchSubscription,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Revisions retained for watch replay. Cursors older than the retained
/// window fail with `ResyncRequired`, same as a compacted store would.
const REPLAY_CAPACITY: usize = 1024;

/// Watch channel headroom beyond the replay window.
const WATCH_BUFFER: usize = 64;

struct Watcher {
    id: u64,
    prefix: String,
    tx: mpsc::Sender<BackendResult<KvEvent>>,
}

struct Lease {
    key: String,
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, Vec<u8>>,
    revision: u64,
    log: VecDeque<(u64, KvEventKind)>,
    watchers: Vec<Watcher>,
    leases: HashMap<String, Lease>,
    /// Which lease currently owns each leased key. A lease that is no
    /// longer the owner expires without touching the key.
    key_leases: HashMap<String, String>,
}

/// The durable half of the in-memory backend: one per cluster address.
///
/// All operations that read or mutate state take the single state lock, so
/// snapshots are atomic with their cursor and watchers observe mutations in
/// a total order.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    next_watcher_id: AtomicU64,
    next_lease_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            next_watcher_id: AtomicU64::new(1),
            next_lease_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        // Lock poisoning only happens if a writer panicked; the state itself
        // is still consistent because mutations are single assignments.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &str) -> BackendResult<Vec<u8>> {
        let mut state = self.lock();
        expire_due_leases(&mut state);
        state
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    pub fn put(&self, key: &str, value: Vec<u8>) -> BackendResult<()> {
        let mut state = self.lock();
        expire_due_leases(&mut state);
        // A plain put detaches the key from any lease
        state.key_leases.remove(key);
        state.entries.insert(key.to_string(), value.clone());
        record_event(
            &mut state,
            KvEventKind::Upsert {
                key: key.to_string(),
                value,
            },
        );
        Ok(())
    }

    pub fn delete(&self, key: &str) -> BackendResult<()> {
        let mut state = self.lock();
        expire_due_leases(&mut state);
        state.key_leases.remove(key);
        if state.entries.remove(key).is_some() {
            record_event(
                &mut state,
                KvEventKind::Delete {
                    key: key.to_string(),
                },
            );
        }
        Ok(())
    }

    pub fn snapshot(&self, prefix: &str) -> BackendResult<Snapshot> {
        let mut state = self.lock();
        expire_due_leases(&mut state);
        let mut pairs: Vec<KvPair> = state
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvPair::new(k.clone(), v.clone()))
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Snapshot {
            pairs,
            cursor: Some(state.revision.to_string()),
        })
    }

    /// Open a watch. With a cursor, replays every retained event after that
    /// revision; a cursor outside the retained window is `ResyncRequired`.
    pub fn watch(&self, prefix: &str, cursor: Option<String>) -> BackendResult<WatchSubscription> {
        self.register_watch(prefix, cursor).map(|(_, sub)| sub)
    }

    fn register_watch(
        &self,
        prefix: &str,
        cursor: Option<String>,
    ) -> BackendResult<(u64, WatchSubscription)> {
        let mut state = self.lock();
        expire_due_leases(&mut state);

        let (tx, rx) = mpsc::channel(REPLAY_CAPACITY + WATCH_BUFFER);

        if let Some(raw) = cursor {
            let from: u64 = raw
                .parse()
                .map_err(|_| BackendError::ResyncRequired(format!("unparseable cursor {raw:?}")))?;
            if from > state.revision {
                return Err(BackendError::ResyncRequired(format!(
                    "cursor {} ahead of store revision {}",
                    from, state.revision
                )));
            }
            if from < state.revision {
                let oldest = state.log.front().map(|(rev, _)| *rev);
                match oldest {
                    Some(oldest) if oldest <= from + 1 => {
                        for (rev, kind) in state.log.iter().filter(|(rev, _)| *rev > from) {
                            if kind.key().starts_with(prefix) {
                                // Capacity covers the whole retained log, so
                                // this never blocks under the state lock.
                                let _ = tx.try_send(Ok(KvEvent {
                                    kind: kind.clone(),
                                    cursor: Some(rev.to_string()),
                                }));
                            }
                        }
                    }
                    _ => {
                        return Err(BackendError::ResyncRequired(format!(
                            "cursor {} older than retained history",
                            from
                        )));
                    }
                }
            }
        }

        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        state.watchers.push(Watcher {
            id,
            prefix: prefix.to_string(),
            tx,
        });
        Ok((id, WatchSubscription::new(true, rx)))
    }

    pub fn put_with_lease(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BackendResult<LeaseHandle> {
        let mut state = self.lock();
        expire_due_leases(&mut state);
        state.entries.insert(key.to_string(), value.clone());
        record_event(
            &mut state,
            KvEventKind::Upsert {
                key: key.to_string(),
                value,
            },
        );

        let id = format!("lease-{}", self.next_lease_id.fetch_add(1, Ordering::Relaxed));
        state.leases.insert(
            id.clone(),
            Lease {
                key: key.to_string(),
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        state.key_leases.insert(key.to_string(), id.clone());
        Ok(LeaseHandle {
            id,
            key: key.to_string(),
            ttl,
        })
    }

    pub fn renew_lease(&self, lease: &LeaseHandle) -> BackendResult<()> {
        let mut state = self.lock();
        expire_due_leases(&mut state);
        match state.leases.get_mut(&lease.id) {
            Some(entry) => {
                entry.expires_at = Instant::now() + entry.ttl;
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("lease {}", lease.id))),
        }
    }

    fn drop_watchers(&self, ids: &[u64]) {
        let mut state = self.lock();
        state.watchers.retain(|w| !ids.contains(&w.id));
    }
}

/// Expire leases whose deadline passed, deleting their keys through the
/// normal event path. Called under the state lock by every operation, which
/// stands in for a store-side expiry sweep.
fn expire_due_leases(state: &mut StoreState) {
    let now = Instant::now();
    let due: Vec<String> = state
        .leases
        .iter()
        .filter(|(_, l)| l.expires_at <= now)
        .map(|(id, _)| id.clone())
        .collect();
    for id in due {
        if let Some(lease) = state.leases.remove(&id) {
            // Only the lease that currently owns the key may take it down
            if state.key_leases.get(&lease.key) != Some(&id) {
                continue;
            }
            state.key_leases.remove(&lease.key);
            if state.entries.remove(&lease.key).is_some() {
                record_event(&mut *state, KvEventKind::Delete { key: lease.key });
            }
        }
    }
}

fn record_event(state: &mut StoreState, kind: KvEventKind) {
    state.revision += 1;
    let rev = state.revision;
    state.log.push_back((rev, kind.clone()));
    while state.log.len() > REPLAY_CAPACITY {
        state.log.pop_front();
    }

    let event_key = kind.key().to_string();
    state.watchers.retain(|watcher| {
        if !event_key.starts_with(&watcher.prefix) {
            return true;
        }
        let event = KvEvent {
            kind: kind.clone(),
            cursor: Some(rev.to_string()),
        };
        // A full or closed channel ends that watch; the subscriber resumes
        // from its cursor on the next connection.
        watcher.tx.try_send(Ok(event)).is_ok()
    });
}

/// One connection to a [`MemoryStore`].
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    closed: AtomicBool,
    watcher_ids: Mutex<Vec<u64>>,
}

impl MemoryBackend {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            closed: AtomicBool::new(false),
            watcher_ids: Mutex::new(Vec::new()),
        }
    }

    fn check_open(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackendError::Transient("connection closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl KvBackend for MemoryBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.check_open()?;
            self.store.get(key)
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_open()?;
            self.store.put(key, value)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_open()?;
            self.store.delete(key)
        })
    }

    fn snapshot<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Snapshot> {
        Box::pin(async move {
            self.check_open()?;
            self.store.snapshot(prefix)
        })
    }

    fn watch<'a>(
        &'a self,
        prefix: &'a str,
        cursor: Option<String>,
    ) -> BoxFuture<'a, WatchSubscription> {
        Box::pin(async move {
            self.check_open()?;
            let (id, sub) = self.store.register_watch(prefix, cursor)?;
            let mut ids = match self.watcher_ids.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            ids.push(id);
            Ok(sub)
        })
    }

    fn put_with_lease<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, LeaseHandle> {
        Box::pin(async move {
            self.check_open()?;
            self.store.put_with_lease(key, value, ttl)
        })
    }

    fn renew_lease<'a>(&'a self, lease: &'a LeaseHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_open()?;
            self.store.renew_lease(lease)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                let ids = match self.watcher_ids.lock() {
                    Ok(mut guard) => std::mem::take(&mut *guard),
                    Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
                };
                self.store.drop_watchers(&ids);
            }
            Ok(())
        })
    }
}

/// Connector mapping addresses to shared [`MemoryStore`]s.
///
/// The same address always resolves to the same store, so reconnecting
/// reaches the data a previous connection wrote. Tests pre-seed a cluster
/// via [`MemoryConnector::store`] before the registry ever connects.
#[derive(Default)]
pub struct MemoryConnector {
    stores: dashmap::DashMap<String, Arc<MemoryStore>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store behind an address, created on first use.
    pub fn store(&self, address: &str) -> Arc<MemoryStore> {
        self.stores
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }
}

impl BackendConnector for MemoryConnector {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Arc<dyn KvBackend>> {
        Box::pin(async move {
            let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new(self.store(address)));
            Ok(backend)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_get_put_delete() {
        let s = store();
        assert!(matches!(s.get("a"), Err(BackendError::NotFound(_))));

        s.put("a", b"1".to_vec()).unwrap();
        assert_eq!(s.get("a").unwrap(), b"1");

        s.put("a", b"2".to_vec()).unwrap();
        assert_eq!(s.get("a").unwrap(), b"2");

        s.delete("a").unwrap();
        assert!(matches!(s.get("a"), Err(BackendError::NotFound(_))));

        // Deleting a missing key succeeds and records no event
        let rev_before = s.snapshot("").unwrap().cursor;
        s.delete("missing").unwrap();
        assert_eq!(s.snapshot("").unwrap().cursor, rev_before);
    }

    #[test]
    fn test_snapshot_filters_by_prefix() {
        let s = store();
        s.put("mesh/state/a", b"1".to_vec()).unwrap();
        s.put("mesh/state/b", b"2".to_vec()).unwrap();
        s.put("other/c", b"3".to_vec()).unwrap();

        let snap = s.snapshot("mesh/state/").unwrap();
        assert_eq!(snap.pairs.len(), 2);
        assert_eq!(snap.pairs[0].key, "mesh/state/a");
        assert_eq!(snap.pairs[1].key, "mesh/state/b");
        assert_eq!(snap.cursor.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_watch_sees_live_events_in_order() {
        let s = store();
        let mut sub = s.watch("k/", None).unwrap();

        s.put("k/a", b"1".to_vec()).unwrap();
        s.put("k/b", b"2".to_vec()).unwrap();
        s.delete("k/a").unwrap();

        let e1 = sub.recv().await.unwrap().unwrap();
        let e2 = sub.recv().await.unwrap().unwrap();
        let e3 = sub.recv().await.unwrap().unwrap();
        assert_eq!(e1.kind.key(), "k/a");
        assert_eq!(e2.kind.key(), "k/b");
        assert!(matches!(e3.kind, KvEventKind::Delete { .. }));
        assert_eq!(e3.cursor.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let s = store();
        let mut sub = s.watch("mesh/", None).unwrap();

        s.put("other/x", b"1".to_vec()).unwrap();
        s.put("mesh/y", b"2".to_vec()).unwrap();

        let event = sub.recv().await.unwrap().unwrap();
        assert_eq!(event.kind.key(), "mesh/y");
    }

    #[tokio::test]
    async fn test_snapshot_cursor_handoff_sees_only_later_events() {
        let s = store();
        s.put("k/a", b"1".to_vec()).unwrap();
        s.put("k/b", b"2".to_vec()).unwrap();

        let snap = s.snapshot("k/").unwrap();
        s.put("k/c", b"3".to_vec()).unwrap();

        let mut sub = s.watch("k/", snap.cursor).unwrap();
        let event = sub.recv().await.unwrap().unwrap();
        assert_eq!(event.kind.key(), "k/c");
    }

    #[tokio::test]
    async fn test_resume_replays_events_missed_while_disconnected() {
        let s = store();
        let mut sub = s.watch("k/", None).unwrap();
        s.put("k/a", b"1".to_vec()).unwrap();
        let cursor = sub.recv().await.unwrap().unwrap().cursor;
        drop(sub);

        // Mutations while no watch is connected
        s.put("k/b", b"2".to_vec()).unwrap();
        s.delete("k/a").unwrap();

        let mut sub = s.watch("k/", cursor).unwrap();
        let e1 = sub.recv().await.unwrap().unwrap();
        let e2 = sub.recv().await.unwrap().unwrap();
        assert_eq!(e1.kind.key(), "k/b");
        assert!(matches!(e2.kind, KvEventKind::Delete { ref key } if key == "k/a"));
    }

    #[test]
    fn test_cursor_beyond_retained_history_requires_resync() {
        let s = store();
        s.put("k/first", b"0".to_vec()).unwrap();
        for i in 0..(REPLAY_CAPACITY + 10) {
            s.put(&format!("k/{i}"), b"v".to_vec()).unwrap();
        }
        let err = s.watch("k/", Some("1".to_string())).unwrap_err();
        assert!(err.is_resync_required());
    }

    #[test]
    fn test_garbage_cursor_requires_resync() {
        let s = store();
        assert!(s
            .watch("k/", Some("not-a-revision".to_string()))
            .unwrap_err()
            .is_resync_required());
        // A cursor from a store with more history than this one
        assert!(s
            .watch("k/", Some("999999".to_string()))
            .unwrap_err()
            .is_resync_required());
    }

    #[tokio::test]
    async fn test_lease_expires_without_renewal() {
        let s = store();
        let lease = s
            .put_with_lease("hb", b"alive".to_vec(), Duration::from_millis(20))
            .unwrap();
        assert_eq!(s.get("hb").unwrap(), b"alive");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(s.get("hb"), Err(BackendError::NotFound(_))));
        assert!(matches!(
            s.renew_lease(&lease),
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_renewal_keeps_lease_alive() {
        let s = store();
        let lease = s
            .put_with_lease("hb", b"alive".to_vec(), Duration::from_millis(80))
            .unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            s.renew_lease(&lease).unwrap();
        }
        assert_eq!(s.get("hb").unwrap(), b"alive");
    }

    #[tokio::test]
    async fn test_superseding_lease_detaches_the_old_one() {
        let s = store();
        s.put_with_lease("hb", b"v1".to_vec(), Duration::from_millis(30))
            .unwrap();
        // Re-leasing the key takes ownership away from the first lease
        s.put_with_lease("hb", b"v2".to_vec(), Duration::from_millis(500))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(s.get("hb").unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_plain_put_detaches_lease() {
        let s = store();
        s.put_with_lease("k", b"leased".to_vec(), Duration::from_millis(30))
            .unwrap();
        s.put("k", b"durable".to_vec()).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(s.get("k").unwrap(), b"durable");
    }

    #[tokio::test]
    async fn test_lease_expiry_emits_delete_event() {
        let s = store();
        let mut sub = s.watch("hb", None).unwrap();
        s.put_with_lease("hb", b"alive".to_vec(), Duration::from_millis(20))
            .unwrap();
        let first = sub.recv().await.unwrap().unwrap();
        assert!(matches!(first.kind, KvEventKind::Upsert { .. }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        // Any locked operation sweeps due leases
        let _ = s.get("unrelated");
        let second = sub.recv().await.unwrap().unwrap();
        assert!(matches!(second.kind, KvEventKind::Delete { ref key } if key == "hb"));
    }

    #[tokio::test]
    async fn test_backend_close_is_idempotent_and_ends_watch() {
        let connector = MemoryConnector::new();
        let backend = connector.connect("mem://a").await.unwrap();

        let mut sub = backend.watch("k/", None).await.unwrap();
        backend.close().await.unwrap();
        backend.close().await.unwrap();

        // Watch ends without an error item
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            backend.get("k/x").await,
            Err(BackendError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_connector_shares_store_per_address() {
        let connector = MemoryConnector::new();
        let first = connector.connect("mem://a").await.unwrap();
        first.put("k", b"v".to_vec()).await.unwrap();
        first.close().await.unwrap();

        let second = connector.connect("mem://a").await.unwrap();
        assert_eq!(second.get("k").await.unwrap(), b"v");

        let other = connector.connect("mem://b").await.unwrap();
        assert!(matches!(
            other.get("k").await,
            Err(BackendError::NotFound(_))
        ));
    }
}
