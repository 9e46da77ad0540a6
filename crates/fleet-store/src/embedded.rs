//! Embedded backend on redb.
//!
//! Values are stored as a fixed 24-byte header (create revision, mod
//! revision, lease, little-endian i64) followed by the payload. The global
//! revision lives in the `meta` table and moves in the same transaction as
//! the write it numbers.
//!
//! Watches are served from a bounded in-memory history plus a broadcast
//! channel; a watcher asking for revisions older than the history gets
//! `Compacted`. Leases are process-local: keys still carrying a lease when
//! an on-disk database is reopened are dropped at open.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{KeyValue, KvBackend, RawEvent, RawEventKind, RawWatchStream};
use crate::error::{StoreError, StoreResult};

const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const META: TableDefinition<&str, i64> = TableDefinition::new("meta");
const REVISION: &str = "revision";

const HEADER_LEN: usize = 24;
const HISTORY_LIMIT: usize = 10_000;
const BROADCAST_CAPACITY: usize = 1024;
const WATCH_BUFFER: usize = 100;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

fn encode_record(create: i64, modified: i64, lease: i64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + value.len());
    out.extend_from_slice(&create.to_le_bytes());
    out.extend_from_slice(&modified.to_le_bytes());
    out.extend_from_slice(&lease.to_le_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_record(key: &str, raw: &[u8]) -> StoreResult<KeyValue> {
    if raw.len() < HEADER_LEN {
        return Err(StoreError::Unknown(format!("corrupt record for {key}")));
    }
    let field = |i: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw[i * 8..i * 8 + 8]);
        i64::from_le_bytes(buf)
    };
    Ok(KeyValue {
        key: key.to_string(),
        create_revision: field(0),
        mod_revision: field(1),
        lease: field(2),
        value: raw[HEADER_LEN..].to_vec(),
    })
}

struct Shared {
    history: VecDeque<RawEvent>,
    /// Oldest revision a watch may still start from.
    floor: i64,
    leases: HashMap<i64, Instant>,
    next_lease: i64,
}

/// redb-backed [`KvBackend`], on disk or in memory.
#[derive(Clone)]
pub struct EmbeddedBackend {
    db: Arc<Database>,
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<RawEvent>,
}

impl EmbeddedBackend {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Unknown))?;
        let backend = Self::with_database(db)?;
        let purged = backend.purge_leased_keys()?;
        debug!(?path, purged, "embedded store opened");
        Ok(backend)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(map_err!(Unknown))?;
        let backend = Self::with_database(db)?;
        debug!("in-memory embedded store opened");
        Ok(backend)
    }

    fn with_database(db: Database) -> StoreResult<Self> {
        let txn = db.begin_write().map_err(map_err!(Unknown))?;
        txn.open_table(KV).map_err(map_err!(Unknown))?;
        txn.open_table(META).map_err(map_err!(Unknown))?;
        txn.commit().map_err(map_err!(Unknown))?;

        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let backend = Self {
            db: Arc::new(db),
            shared: Arc::new(Mutex::new(Shared {
                history: VecDeque::new(),
                floor: 1,
                leases: HashMap::new(),
                next_lease: 1,
            })),
            events,
        };
        let rev = backend.read_revision()?;
        backend.lock().floor = rev + 1;
        Ok(backend)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_revision(&self) -> StoreResult<i64> {
        let txn = self.db.begin_read().map_err(map_err!(Unknown))?;
        let meta = txn.open_table(META).map_err(map_err!(Unknown))?;
        let rev = meta
            .get(REVISION)
            .map_err(map_err!(Unknown))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(rev)
    }

    fn purge_leased_keys(&self) -> StoreResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Unknown))?;
        let purged = {
            let mut kv = txn.open_table(KV).map_err(map_err!(Unknown))?;
            let mut leased = Vec::new();
            for entry in kv.iter().map_err(map_err!(Unknown))? {
                let (k, v) = entry.map_err(map_err!(Unknown))?;
                let record = decode_record(k.value(), v.value())?;
                if record.lease != 0 {
                    leased.push(record.key);
                }
            }
            for key in &leased {
                kv.remove(key.as_str()).map_err(map_err!(Unknown))?;
            }
            leased.len()
        };
        txn.commit().map_err(map_err!(Unknown))?;
        Ok(purged)
    }

    fn publish(&self, shared: &mut Shared, event: RawEvent) {
        shared.history.push_back(event.clone());
        while shared.history.len() > HISTORY_LIMIT {
            if let Some(old) = shared.history.pop_front() {
                shared.floor = old.revision() + 1;
            }
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Delete every key whose lease has expired. Caller holds the lock.
    fn reap_locked(&self, shared: &mut Shared) -> StoreResult<usize> {
        let now = Instant::now();
        let expired: Vec<i64> = shared
            .leases
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        for id in &expired {
            shared.leases.remove(id);
        }

        let txn = self.db.begin_write().map_err(map_err!(Unknown))?;
        let events = {
            let mut kv = txn.open_table(KV).map_err(map_err!(Unknown))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Unknown))?;
            let mut victims = Vec::new();
            for entry in kv.iter().map_err(map_err!(Unknown))? {
                let (k, v) = entry.map_err(map_err!(Unknown))?;
                let record = decode_record(k.value(), v.value())?;
                if expired.contains(&record.lease) {
                    victims.push(record);
                }
            }
            let mut rev = meta
                .get(REVISION)
                .map_err(map_err!(Unknown))?
                .map(|g| g.value())
                .unwrap_or(0);
            let mut events = Vec::with_capacity(victims.len());
            for prev in victims {
                rev += 1;
                kv.remove(prev.key.as_str()).map_err(map_err!(Unknown))?;
                events.push(RawEvent {
                    kind: RawEventKind::Delete,
                    kv: KeyValue {
                        key: prev.key.clone(),
                        value: Vec::new(),
                        create_revision: 0,
                        mod_revision: rev,
                        lease: 0,
                    },
                    prev: Some(prev),
                });
            }
            meta.insert(REVISION, rev).map_err(map_err!(Unknown))?;
            events
        };
        txn.commit().map_err(map_err!(Unknown))?;

        let reaped = events.len();
        for event in events {
            debug!(key = %event.kv.key, "lease expired");
            self.publish(shared, event);
        }
        Ok(reaped)
    }

    /// Expire leased keys now. Returns how many keys were removed.
    pub fn reap_expired(&self) -> StoreResult<usize> {
        let mut shared = self.lock();
        self.reap_locked(&mut shared)
    }

    /// Periodically expire leased keys until cancelled.
    pub async fn run_lease_reaper(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reap_expired() {
                        warn!(error = %e, "lease reaping failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    fn write(
        &self,
        key: &str,
        value: Option<&[u8]>,
        lease: i64,
        only_if_absent: bool,
    ) -> StoreResult<Option<KeyValue>> {
        let mut shared = self.lock();
        self.reap_locked(&mut shared)?;
        if lease != 0 && !shared.leases.contains_key(&lease) {
            return Err(StoreError::Unknown(format!("lease {lease} not found")));
        }

        let txn = self.db.begin_write().map_err(map_err!(Unknown))?;
        let (prev, event) = {
            let mut kv = txn.open_table(KV).map_err(map_err!(Unknown))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Unknown))?;
            let prev = kv
                .get(key)
                .map_err(map_err!(Unknown))?
                .map(|g| decode_record(key, g.value()))
                .transpose()?;
            if only_if_absent && prev.is_some() {
                return Err(StoreError::Exists(key.to_string()));
            }
            if value.is_none() && prev.is_none() {
                return Ok(None);
            }

            let rev = meta
                .get(REVISION)
                .map_err(map_err!(Unknown))?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            let event = match value {
                Some(value) => {
                    let create = prev.as_ref().map_or(rev, |p| p.create_revision);
                    kv.insert(key, encode_record(create, rev, lease, value).as_slice())
                        .map_err(map_err!(Unknown))?;
                    RawEvent {
                        kind: RawEventKind::Put,
                        kv: KeyValue {
                            key: key.to_string(),
                            value: value.to_vec(),
                            create_revision: create,
                            mod_revision: rev,
                            lease,
                        },
                        prev: prev.clone(),
                    }
                }
                None => {
                    kv.remove(key).map_err(map_err!(Unknown))?;
                    RawEvent {
                        kind: RawEventKind::Delete,
                        kv: KeyValue {
                            key: key.to_string(),
                            value: Vec::new(),
                            create_revision: 0,
                            mod_revision: rev,
                            lease: 0,
                        },
                        prev: prev.clone(),
                    }
                }
            };
            meta.insert(REVISION, rev).map_err(map_err!(Unknown))?;
            (prev, event)
        };
        txn.commit().map_err(map_err!(Unknown))?;
        self.publish(&mut shared, event);
        Ok(prev)
    }
}

#[async_trait]
impl KvBackend for EmbeddedBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.reap_expired()?;
        let txn = self.db.begin_read().map_err(map_err!(Unknown))?;
        let table = txn.open_table(KV).map_err(map_err!(Unknown))?;
        table
            .get(key)
            .map_err(map_err!(Unknown))?
            .map(|g| decode_record(key, g.value()))
            .transpose()
    }

    async fn range(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, i64)> {
        self.reap_expired()?;
        let txn = self.db.begin_read().map_err(map_err!(Unknown))?;
        let table = txn.open_table(KV).map_err(map_err!(Unknown))?;
        let meta = txn.open_table(META).map_err(map_err!(Unknown))?;
        let rev = meta
            .get(REVISION)
            .map_err(map_err!(Unknown))?
            .map(|g| g.value())
            .unwrap_or(0);

        let mut out = Vec::new();
        for entry in table.range::<&str>(prefix..).map_err(map_err!(Unknown))? {
            let (k, v) = entry.map_err(map_err!(Unknown))?;
            if !k.value().starts_with(prefix) {
                break;
            }
            out.push(decode_record(k.value(), v.value())?);
        }
        Ok((out, rev))
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease: i64) -> StoreResult<()> {
        self.write(key, Some(&value), lease, true).map(|_| ())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: i64) -> StoreResult<Option<KeyValue>> {
        self.write(key, Some(&value), lease, false)
    }

    async fn delete(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.write(key, None, 0, false)
    }

    async fn grant_lease(&self, ttl: i64) -> StoreResult<i64> {
        let mut shared = self.lock();
        let id = shared.next_lease;
        shared.next_lease += 1;
        let ttl = Duration::from_secs(ttl.max(1) as u64);
        shared.leases.insert(id, Instant::now() + ttl);
        Ok(id)
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> StoreResult<RawWatchStream> {
        let (backlog, mut live, start) = {
            let shared = self.lock();
            let current = self.read_revision()?;
            let start = if start_revision <= 0 {
                current + 1
            } else {
                start_revision
            };
            if start < shared.floor {
                return Err(StoreError::Compacted(shared.floor - 1));
            }
            let backlog: Vec<RawEvent> = shared
                .history
                .iter()
                .filter(|e| e.revision() >= start && e.kv.key.starts_with(prefix))
                .cloned()
                .collect();
            (backlog, self.events.subscribe(), start)
        };

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            let mut last = start - 1;
            for event in backlog {
                last = event.revision();
                if tx.send(Ok(vec![event])).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    received = live.recv() => match received {
                        Ok(event) => {
                            if event.revision() <= last || !event.kv.key.starts_with(&prefix) {
                                continue;
                            }
                            last = event.revision();
                            if tx.send(Ok(vec![event])).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(%prefix, missed, "embedded watcher lagged behind");
                            let _ = tx.send(Err(StoreError::Compacted(last))).await;
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn compact(&self, revision: i64) -> StoreResult<()> {
        let current = self.read_revision()?;
        if revision > current {
            return Err(StoreError::Unknown(format!(
                "cannot compact future revision {revision} (current {current})"
            )));
        }
        let mut shared = self.lock();
        if revision > shared.floor {
            shared.floor = revision;
            shared.history.retain(|e| e.revision() >= revision);
            debug!(revision, "embedded history compacted");
        }
        Ok(())
    }

    async fn current_revision(&self) -> StoreResult<i64> {
        self.read_revision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_put_delete_bump_revisions() {
        let be = EmbeddedBackend::open_in_memory().unwrap();
        be.create("/a/1", b"one".to_vec(), 0).await.unwrap();
        assert!(matches!(
            be.create("/a/1", b"again".to_vec(), 0).await,
            Err(StoreError::Exists(_))
        ));

        let prev = be.put("/a/1", b"uno".to_vec(), 0).await.unwrap().unwrap();
        assert_eq!(prev.value, b"one");
        let now = be.get("/a/1").await.unwrap().unwrap();
        assert_eq!(now.create_revision, 1);
        assert_eq!(now.mod_revision, 2);

        let gone = be.delete("/a/1").await.unwrap().unwrap();
        assert_eq!(gone.value, b"uno");
        assert!(be.delete("/a/1").await.unwrap().is_none());
        assert_eq!(be.current_revision().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn range_is_prefix_bounded_and_sorted() {
        let be = EmbeddedBackend::open_in_memory().unwrap();
        for key in ["/x/b", "/x/a", "/y/a", "/x0"] {
            be.put(key, key.as_bytes().to_vec(), 0).await.unwrap();
        }
        let (kvs, rev) = be.range("/x/").await.unwrap();
        let keys: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, ["/x/a", "/x/b"]);
        assert_eq!(rev, 4);
    }

    #[tokio::test]
    async fn watch_replays_history_then_streams() {
        let be = EmbeddedBackend::open_in_memory().unwrap();
        be.put("/w/a", b"1".to_vec(), 0).await.unwrap();
        be.put("/other", b"x".to_vec(), 0).await.unwrap();

        let mut rx = be.watch("/w/", 1).await.unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first[0].kv.key, "/w/a");

        be.delete("/w/a").await.unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second[0].kind, RawEventKind::Delete);
        assert_eq!(second[0].prev.as_ref().unwrap().value, b"1");
    }

    #[tokio::test]
    async fn watch_below_compaction_fails() {
        let be = EmbeddedBackend::open_in_memory().unwrap();
        for i in 0..5 {
            be.put("/c", vec![i], 0).await.unwrap();
        }
        be.compact(4).await.unwrap();
        assert!(matches!(be.watch("/c", 2).await, Err(StoreError::Compacted(_))));
        assert!(be.watch("/c", 4).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn leased_keys_expire() {
        let be = EmbeddedBackend::open_in_memory().unwrap();
        let lease = be.grant_lease(10).await.unwrap();
        be.put("/hosts/stat/h1", b"up".to_vec(), lease).await.unwrap();
        be.put("/hosts/info/h1", b"static".to_vec(), 0).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(be.get("/hosts/stat/h1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(be.get("/hosts/stat/h1").await.unwrap().is_none());
        assert!(be.get("/hosts/info/h1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_lease_is_rejected() {
        let be = EmbeddedBackend::open_in_memory().unwrap();
        assert!(be.put("/k", b"v".to_vec(), 42).await.is_err());
    }

    #[tokio::test]
    async fn reopen_drops_leased_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.redb");
        {
            let be = EmbeddedBackend::open(&path).unwrap();
            let lease = be.grant_lease(60).await.unwrap();
            be.put("/leased", b"v".to_vec(), lease).await.unwrap();
            be.put("/durable", b"v".to_vec(), 0).await.unwrap();
        }
        let be = EmbeddedBackend::open(&path).unwrap();
        assert!(be.get("/leased").await.unwrap().is_none());
        assert!(be.get("/durable").await.unwrap().is_some());
        assert_eq!(be.current_revision().await.unwrap(), 2);
    }
}
