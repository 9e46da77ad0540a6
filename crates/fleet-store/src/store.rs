//! Store — typed CRUD, list and watch over a prefixed key space.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{KeyValue, KvBackend};
use crate::codec::Codec;
use crate::embedded::EmbeddedBackend;
use crate::error::{StoreError, StoreResult};
use crate::predicate::Predicate;
use crate::watch::{self, WatchStream};

/// Typed view of the backend rooted at a prefix such as `/deploy/int/`.
///
/// Cheap to clone; all clones share one backend connection.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
    prefix: String,
}

pub(crate) fn decode_listed<T: Codec>(kv: &KeyValue) -> Option<T> {
    match T::decode(&kv.value) {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!(key = %kv.key, error = %e, "undecodable value skipped");
            None
        }
    }
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>, prefix: &str) -> Self {
        let mut prefix = format!("/{}", prefix.trim_matches('/'));
        if prefix != "/" {
            prefix.push('/');
        }
        Self { backend, prefix }
    }

    /// Store over a fresh in-memory embedded backend.
    pub fn in_memory(prefix: &str) -> StoreResult<Self> {
        Ok(Self::new(Arc::new(EmbeddedBackend::open_in_memory()?), prefix))
    }

    /// Same backend, different root.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self::new(self.backend.clone(), prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    fn absolute(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.trim_start_matches('/'))
    }

    async fn lease(&self, ttl: i64) -> StoreResult<i64> {
        if ttl > 0 {
            self.backend.grant_lease(ttl).await
        } else {
            Ok(0)
        }
    }

    // ── Writes ────────────────────────────────────────────────────

    /// Create `key`; fails with `Exists` when present. `ttl > 0` leases it.
    pub async fn create<T: Codec>(&self, key: &str, obj: &T, ttl: i64) -> StoreResult<()> {
        let abs = self.absolute(key);
        let lease = self.lease(ttl).await?;
        self.backend.create(&abs, obj.encode()?, lease).await?;
        debug!(key = %abs, ttl, "created");
        Ok(())
    }

    /// Unconditional put. Returns the previous value when it decodes as `T`.
    pub async fn update<T: Codec>(&self, key: &str, obj: &T, ttl: i64) -> StoreResult<Option<T>> {
        let abs = self.absolute(key);
        let lease = self.lease(ttl).await?;
        let prev = self.backend.put(&abs, obj.encode()?, lease).await?;
        Ok(prev.and_then(|kv| T::decode(&kv.value).ok()))
    }

    /// Read-and-delete. Fails with `NotFound` when absent.
    pub async fn delete<T: Codec>(&self, key: &str) -> StoreResult<T> {
        let abs = self.absolute(key);
        match self.backend.delete(&abs).await? {
            Some(prev) => {
                debug!(key = %abs, "deleted");
                T::decode(&prev.value)
            }
            None => Err(StoreError::NotFound(abs)),
        }
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub async fn try_get<T: Codec>(&self, key: &str) -> StoreResult<Option<T>> {
        let abs = self.absolute(key);
        self.backend
            .get(&abs)
            .await?
            .map(|kv| T::decode(&kv.value))
            .transpose()
    }

    /// Fails with `NotFound` when absent.
    pub async fn get<T: Codec>(&self, key: &str) -> StoreResult<T> {
        self.try_get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(self.absolute(key)))
    }

    /// Like [`Store::get`] but a missing key yields `T::default()`.
    pub async fn get_or_default<T: Codec + Default>(&self, key: &str) -> StoreResult<T> {
        Ok(self.try_get(key).await?.unwrap_or_default())
    }

    async fn range(&self, prefix: &str) -> StoreResult<(String, Vec<KeyValue>)> {
        let abs = self.absolute(prefix);
        let (kvs, _) = self.backend.range(&abs).await?;
        Ok((abs, kvs))
    }

    /// Every object under `prefix` accepted by `predicate`, in key order.
    ///
    /// Values that do not decode as `T` are logged and left out.
    pub async fn list<T: Codec>(&self, prefix: &str, predicate: &Predicate<T>) -> StoreResult<Vec<T>> {
        let (_, kvs) = self.range(prefix).await?;
        let mut out = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let Some(obj) = decode_listed::<T>(&kv) else {
                continue;
            };
            if predicate.matches(&obj) {
                out.push(obj);
            }
        }
        Ok(out)
    }

    /// Like [`Store::list`], keyed by the path suffix after `prefix`.
    pub async fn list_map<T: Codec>(
        &self,
        prefix: &str,
        predicate: &Predicate<T>,
    ) -> StoreResult<BTreeMap<String, T>> {
        let (abs, kvs) = self.range(prefix).await?;
        let mut out = BTreeMap::new();
        for kv in kvs {
            let Some(obj) = decode_listed::<T>(&kv) else {
                continue;
            };
            if predicate.matches(&obj) {
                let suffix = kv.key.strip_prefix(&abs).unwrap_or(&kv.key);
                out.insert(suffix.to_string(), obj);
            }
        }
        Ok(out)
    }

    /// Distinct immediate child segments under `prefix`.
    pub async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let dir = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        let (abs, kvs) = self.range(&dir).await?;
        let mut out: Vec<String> = Vec::new();
        for kv in kvs {
            let Some(rest) = kv.key.strip_prefix(&abs) else {
                continue;
            };
            let child = rest.split('/').next().unwrap_or_default();
            if !child.is_empty() && out.last().map(String::as_str) != Some(child) {
                out.push(child.to_string());
            }
        }
        Ok(out)
    }

    // ── Watches ───────────────────────────────────────────────────

    /// Watch `key` (or everything under it when `recursive`).
    ///
    /// Event keys are relative to `key` for recursive watches and relative to
    /// the store prefix otherwise.
    pub async fn watch<T: Codec>(
        &self,
        key: &str,
        predicate: Predicate<T>,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> StoreResult<WatchStream<T>> {
        let target = self.absolute(key);
        let base = if recursive {
            target.clone()
        } else {
            self.prefix.clone()
        };
        watch::start(
            self.backend.clone(),
            target,
            base,
            recursive,
            predicate,
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{DeployKey, DeploySpec, Instance};

    fn store() -> Store {
        Store::in_memory("/deploy/dev").unwrap()
    }

    #[tokio::test]
    async fn create_get_delete() {
        let s = store();
        let spec = DeploySpec::single("v1.0.0", 1);
        s.create("deploy/expect/h1/java/crm", &spec, 0).await.unwrap();
        let err = s.create("deploy/expect/h1/java/crm", &spec, 0).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Exists);

        let got: DeploySpec = s.get("deploy/expect/h1/java/crm").await.unwrap();
        assert_eq!(got, spec);

        let gone: DeploySpec = s.delete("deploy/expect/h1/java/crm").await.unwrap();
        assert_eq!(gone, spec);
        let err = s.delete::<DeploySpec>("deploy/expect/h1/java/crm").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn get_missing_honours_ignore_not_found() {
        let s = store();
        assert!(s.get::<DeploySpec>("nope").await.unwrap_err().is_not_found());
        let zero: DeploySpec = s.get_or_default("nope").await.unwrap();
        assert!(zero.is_empty());
    }

    #[tokio::test]
    async fn update_returns_previous() {
        let s = store();
        assert!(s.update("k", &DeploySpec::single("v1", 1), 0).await.unwrap().is_none());
        let prev = s.update("k", &DeploySpec::single("v2", 1), 0).await.unwrap();
        assert_eq!(prev, Some(DeploySpec::single("v1", 1)));
    }

    #[tokio::test]
    async fn list_map_keys_are_suffixes() {
        let s = store();
        for host in ["h1", "h2"] {
            let key = format!("deploy/expect/{host}/java/crm");
            s.update(&key, &DeploySpec::single("v1", 1), 0).await.unwrap();
        }
        s.update("deploy/expect/h2/redis/cache", &DeploySpec::single("v7", 1), 0)
            .await
            .unwrap();

        let all: BTreeMap<String, DeploySpec> = s
            .list_map("deploy/expect/", &Predicate::everything())
            .await
            .unwrap();
        let keys: Vec<_> = all.keys().map(String::as_str).collect();
        assert_eq!(keys, ["h1/java/crm", "h2/java/crm", "h2/redis/cache"]);

        let hosts = s.list_keys("deploy/expect").await.unwrap();
        assert_eq!(hosts, ["h1", "h2"]);
        let types = s.list_keys("deploy/expect/h2/").await.unwrap();
        assert_eq!(types, ["java", "redis"]);
    }

    #[tokio::test]
    async fn raw_bytes_are_stored_verbatim() {
        let s = Store::in_memory("/mnt/zk").unwrap();
        s.update("int/route/2/crm/route", &b"a = 1;2".to_vec(), 0).await.unwrap();
        let raw = s
            .backend()
            .get("/mnt/zk/int/route/2/crm/route")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.value, b"a = 1;2");
    }

    #[tokio::test]
    async fn list_with_predicate() {
        let s = store();
        let key = DeployKey::new("java", "crm");
        for (id, host) in [("i1", "h1"), ("i2", "h2"), ("i3", "h1")] {
            let ins = Instance::sample(&key, id, host, "v1");
            s.update(&format!("deploy/actual/{host}/java/crm/{id}"), &ins, 0)
                .await
                .unwrap();
        }
        let pred = Predicate::fields("hostID=h1".parse().unwrap(), |ins: &Instance| {
            let mut attrs = crate::Attrs::default();
            attrs.fields.insert("hostID".into(), ins.host_id.clone());
            attrs
        });
        let on_h1: Vec<Instance> = s.list("deploy/actual/", &pred).await.unwrap();
        let ids: Vec<_> = on_h1.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["i1", "i3"]);
    }
}
