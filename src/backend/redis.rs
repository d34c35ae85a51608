//! Redis-backed [`KvBackend`] using keyspace notifications for watches.
//!
//! Redis keeps no change log, so this adapter has the weakest watch
//! semantics the trait allows: subscriptions are opened with
//! `resumable = false`, a cursor is never produced, and any attempt to
//! resume one reports [`BackendError::ResyncRequired`]. Sessions over this
//! backend therefore re-snapshot after every interruption, which the mirror
//! engine's reset handling turns into a non-disruptive full replace.
//!
//! Watches subscribe to `__keyspace@<db>__:<prefix>*` before the caller
//! snapshots, so changes made during the snapshot scan are still observed.
//! An upsert notification carries only the key; the value is fetched with a
//! follow-up `GET`, and a key that vanished in between is reported as a
//! delete.

use super::{
    BackendConnector, BackendError, BackendResult, BoxFuture, KvBackend, KvEvent, KvEventKind,
    KvPair, LeaseHandle, Snapshot, WatchSubscription,
};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SCAN_BATCH: usize = 512;
const MGET_BATCH: usize = 100;
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// One connection to a Redis instance.
pub struct RedisBackend {
    client: redis::Client,
    connection: ConnectionManager,
    db: i64,
    closed: AtomicBool,
    watch_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisBackend {
    /// Connect and verify the instance is reachable.
    ///
    /// Keyspace notifications are enabled best-effort; managed instances
    /// often reject CONFIG SET and must have them enabled out of band.
    pub async fn connect(address: &str) -> BackendResult<Self> {
        let client = redis::Client::open(address)
            .map_err(|e| BackendError::Fatal(format!("invalid backend address: {e}")))?;
        let db = client.get_connection_info().redis.db;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| map_redis_err("CONNECT", e))?;

        let mut cfg_conn = connection.clone();
        let configured: redis::RedisResult<String> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KEA")
            .query_async(&mut cfg_conn)
            .await;
        if let Err(e) = configured {
            debug!("notify-keyspace-events not applied, watches need it preconfigured: {e}");
        }

        Ok(Self {
            client,
            connection,
            db,
            closed: AtomicBool::new(false),
            watch_tasks: Mutex::new(Vec::new()),
        })
    }

    fn check_open(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackendError::Transient("connection closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl KvBackend for RedisBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.check_open()?;
            let mut conn = self.connection.clone();
            let value: Option<Vec<u8>> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_err("GET", e))?;
            value.ok_or_else(|| BackendError::NotFound(key.to_string()))
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_open()?;
            let mut conn = self.connection.clone();
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_err("SET", e))?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_open()?;
            let mut conn = self.connection.clone();
            let _: i64 = redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_err("DEL", e))?;
            Ok(())
        })
    }

    fn snapshot<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Snapshot> {
        Box::pin(async move {
            self.check_open()?;
            let mut conn = self.connection.clone();

            let mut keys: Vec<String> = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(format!("{prefix}*"))
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_err("SCAN", e))?;
                keys.extend(batch);
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            // SCAN may return duplicates across iterations
            keys.sort();
            keys.dedup();

            let mut pairs = Vec::with_capacity(keys.len());
            for chunk in keys.chunks(MGET_BATCH) {
                let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
                    .arg(chunk)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_err("MGET", e))?;
                for (key, value) in chunk.iter().zip(values) {
                    // Keys deleted between SCAN and MGET come back nil
                    if let Some(value) = value {
                        pairs.push(KvPair::new(key.clone(), value));
                    }
                }
            }

            Ok(Snapshot {
                pairs,
                cursor: None,
            })
        })
    }

    fn watch<'a>(
        &'a self,
        prefix: &'a str,
        cursor: Option<String>,
    ) -> BoxFuture<'a, WatchSubscription> {
        Box::pin(async move {
            if cursor.is_some() {
                return Err(BackendError::ResyncRequired(
                    "keyspace notifications carry no replay position".to_string(),
                ));
            }
            self.check_open()?;

            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| map_redis_err("SUBSCRIBE", e))?;
            let channel_prefix = format!("__keyspace@{}__:", self.db);
            pubsub
                .psubscribe(format!("{channel_prefix}{prefix}*"))
                .await
                .map_err(|e| map_redis_err("PSUBSCRIBE", e))?;

            let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
            let mut conn = self.connection.clone();
            let task = tokio::spawn(async move {
                let mut stream = pubsub.into_on_message();
                while let Some(msg) = stream.next().await {
                    let key = match key_from_channel(msg.get_channel_name(), &channel_prefix) {
                        Some(key) => key.to_string(),
                        None => continue,
                    };
                    let operation: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };

                    let kind = match operation.as_str() {
                        "set" => {
                            let value: Option<Vec<u8>> = match redis::cmd("GET")
                                .arg(&key)
                                .query_async(&mut conn)
                                .await
                            {
                                Ok(value) => value,
                                Err(e) => {
                                    let _ = tx.send(Err(map_redis_err("GET", e))).await;
                                    return;
                                }
                            };
                            match value {
                                Some(value) => KvEventKind::Upsert { key, value },
                                // Deleted again before we could read it
                                None => KvEventKind::Delete { key },
                            }
                        }
                        "del" | "unlink" | "expired" => KvEventKind::Delete { key },
                        _ => continue,
                    };

                    let event = KvEvent { kind, cursor: None };
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                // Subscription stream ended: the server connection is gone.
                // Closing without an error tells the caller to resync.
                debug!("keyspace subscription ended");
            });

            match self.watch_tasks.lock() {
                Ok(mut tasks) => tasks.push(task),
                Err(poisoned) => poisoned.into_inner().push(task),
            }

            Ok(WatchSubscription::new(false, rx))
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
            let mut conn = self.connection.clone();
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_err("SET", e))?;
            Ok(LeaseHandle {
                // Redis has no lease objects; the TTL lives on the key itself
                id: key.to_string(),
                key: key.to_string(),
                ttl,
            })
        })
    }

    fn renew_lease<'a>(&'a self, lease: &'a LeaseHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_open()?;
            let mut conn = self.connection.clone();
            let updated: i64 = redis::cmd("PEXPIRE")
                .arg(&lease.key)
                .arg(ttl_millis(lease.ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_err("PEXPIRE", e))?;
            if updated == 0 {
                // Key already expired: the lease lapsed
                return Err(BackendError::NotFound(format!("lease on {}", lease.key)));
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                let tasks = match self.watch_tasks.lock() {
                    Ok(mut tasks) => std::mem::take(&mut *tasks),
                    Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
                };
                for task in tasks {
                    task.abort();
                }
            }
            Ok(())
        })
    }
}

impl Drop for RedisBackend {
    fn drop(&mut self) {
        let tasks = match self.watch_tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if !tasks.is_empty() && !self.closed.load(Ordering::Acquire) {
            warn!("redis backend dropped with {} live watches", tasks.len());
        }
        for task in tasks {
            task.abort();
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn key_from_channel<'a>(channel: &'a str, channel_prefix: &str) -> Option<&'a str> {
    channel.strip_prefix(channel_prefix)
}

/// Map a redis-rs error onto the backend failure taxonomy.
fn map_redis_err(operation: &str, e: redis::RedisError) -> BackendError {
    use redis::ErrorKind;
    let message = format!("{operation}: {e}");
    match e.kind() {
        ErrorKind::AuthenticationFailed => BackendError::Auth(message),
        ErrorKind::ClusterDown | ErrorKind::MasterDown | ErrorKind::ReadOnly => {
            BackendError::Quorum(message)
        }
        ErrorKind::InvalidClientConfig => BackendError::Fatal(message),
        ErrorKind::IoError | ErrorKind::TryAgain | ErrorKind::BusyLoadingError => {
            BackendError::Transient(message)
        }
        _ => BackendError::Transient(message),
    }
}

/// Connector producing [`RedisBackend`] connections for `redis://` addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

impl RedisConnector {
    pub fn new() -> Self {
        Self
    }
}

impl BackendConnector for RedisConnector {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Arc<dyn KvBackend>> {
        Box::pin(async move {
            let backend: Arc<dyn KvBackend> = Arc::new(RedisBackend::connect(address).await?);
            Ok(backend)
        })
    }
}
