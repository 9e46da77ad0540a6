//! Raw backend contract shared by the embedded and etcd stores.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreResult;

/// One stored key with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    /// Lease id, 0 when the key never expires.
    pub lease: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Put,
    Delete,
}

/// A single mutation observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    /// For deletes only `key` and `mod_revision` are meaningful.
    pub kv: KeyValue,
    pub prev: Option<KeyValue>,
}

impl RawEvent {
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }
}

/// Batches of events in revision order. A terminal `Err` ends the stream.
pub type RawWatchStream = mpsc::Receiver<StoreResult<Vec<RawEvent>>>;

/// Strongly-consistent hierarchical key-value backend.
///
/// Keys are absolute strings; hierarchy is purely by prefix.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// All keys under `prefix`, sorted, with the revision the read saw.
    async fn range(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, i64)>;

    /// Put only when absent; fails with `Exists` otherwise.
    async fn create(&self, key: &str, value: Vec<u8>, lease: i64) -> StoreResult<()>;

    /// Unconditional put returning the previous value.
    async fn put(&self, key: &str, value: Vec<u8>, lease: i64) -> StoreResult<Option<KeyValue>>;

    /// Delete returning the previous value, `None` when absent.
    async fn delete(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Grant a lease expiring after `ttl` seconds.
    async fn grant_lease(&self, ttl: i64) -> StoreResult<i64>;

    /// Watch every key under `prefix` starting at `start_revision` (inclusive).
    ///
    /// Dropping the receiver stops the watch.
    async fn watch(&self, prefix: &str, start_revision: i64) -> StoreResult<RawWatchStream>;

    /// Discard history strictly below `revision`.
    async fn compact(&self, revision: i64) -> StoreResult<()>;

    async fn current_revision(&self) -> StoreResult<i64>;
}
