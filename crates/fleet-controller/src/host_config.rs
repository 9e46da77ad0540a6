//! Host-config manager — desired replica counts per (deploy key, host).
//!
//! Write-through cache over `deploy/expect/{host}/{type}/{name}`. An empty
//! spec is never stored: setting one deletes the key.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use fleet_core::keyspace::{DEPLOY_EXPECT, parse_expect_suffix};
use fleet_core::{DeployKey, DeploySpec, HostId, KeySpace, MultiError};
use fleet_store::{Predicate, Store};
use tracing::{debug, info, warn};

use crate::error::ControllerResult;

type Cache = HashMap<DeployKey, BTreeMap<HostId, DeploySpec>>;

#[derive(Clone)]
pub struct HostConfigManager {
    store: Store,
    keyspace: KeySpace,
    cache: Arc<RwLock<Cache>>,
}

impl HostConfigManager {
    pub fn new(store: Store, keyspace: KeySpace) -> Self {
        Self {
            store,
            keyspace,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the cache with the store's current host configs.
    pub async fn load(&self) -> ControllerResult<()> {
        let listed = self
            .store
            .list_map::<DeploySpec>(DEPLOY_EXPECT, &Predicate::everything())
            .await?;
        let mut fresh = Cache::new();
        for (suffix, spec) in listed {
            match parse_expect_suffix(&suffix) {
                Some((host, key)) => {
                    fresh.entry(key).or_default().insert(host, spec);
                }
                None => warn!(key = %suffix, "ignoring malformed host config key"),
            }
        }
        info!(deployments = fresh.len(), "host configs loaded");
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    /// Write `spec` for `host`, or delete the entry when `spec` is empty.
    pub async fn set_host_config(
        &self,
        key: &DeployKey,
        host: &str,
        spec: DeploySpec,
    ) -> ControllerResult<()> {
        let path = self.keyspace.deploy_expect(host, key);
        if spec.is_empty() {
            match self.store.delete::<DeploySpec>(&path).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            self.forget(key, host);
            debug!(deploy = %key, %host, "host config removed");
            return Ok(());
        }

        self.store.update(&path, &spec, 0).await?;
        debug!(deploy = %key, %host, replicas = spec.total(), "host config written");
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(key.clone())
            .or_default()
            .insert(host.to_string(), spec);
        Ok(())
    }

    /// Remove the entries of `key` on every host in `hosts`.
    pub async fn delete_host_configs(&self, key: &DeployKey, hosts: &[HostId]) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        for host in hosts {
            let path = self.keyspace.deploy_expect(host, key);
            match self.store.delete::<DeploySpec>(&path).await {
                Ok(_) => self.forget(key, host),
                Err(e) if e.is_not_found() => self.forget(key, host),
                Err(e) => errors.push(e),
            }
        }
        errors.into_result()
    }

    fn forget(&self, key: &DeployKey, host: &str) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(hosts) = cache.get_mut(key) {
            hosts.remove(host);
            if hosts.is_empty() {
                cache.remove(key);
            }
        }
    }

    // ── Read-only views ───────────────────────────────────────────

    pub fn get_host_config(&self, key: &DeployKey, host: &str) -> Option<DeploySpec> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.get(key).and_then(|hosts| hosts.get(host)).cloned()
    }

    /// Copy of every host's spec for `key`.
    pub fn list_host_configs(&self, key: &DeployKey) -> BTreeMap<HostId, DeploySpec> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.get(key).cloned().unwrap_or_default()
    }

    pub fn list_deploy_keys(&self) -> Vec<DeployKey> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = cache.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Replicas of `expected` versus every other version across `hc`.
pub fn hc_stat(hc: &BTreeMap<HostId, DeploySpec>, expected: &str) -> (u32, u32) {
    hc.values().fold((0, 0), |(exp, legacy), spec| {
        (exp + spec.num(expected), legacy + spec.legacy_count(expected))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Stage;

    fn setup() -> (Store, HostConfigManager) {
        let ks = KeySpace::new("deploy", Stage::Dev);
        let store = Store::in_memory(&ks.prefix()).unwrap();
        (store.clone(), HostConfigManager::new(store, ks))
    }

    fn crm() -> DeployKey {
        DeployKey::new("java", "crm")
    }

    #[tokio::test]
    async fn empty_spec_deletes_key() {
        let (store, hcm) = setup();
        hcm.set_host_config(&crm(), "h1", DeploySpec::single("v1.0.0", 2))
            .await
            .unwrap();
        assert!(store
            .try_get::<DeploySpec>("deploy/expect/h1/java/crm")
            .await
            .unwrap()
            .is_some());

        hcm.set_host_config(&crm(), "h1", DeploySpec::default())
            .await
            .unwrap();
        assert!(store
            .try_get::<DeploySpec>("deploy/expect/h1/java/crm")
            .await
            .unwrap()
            .is_none());
        assert!(hcm.get_host_config(&crm(), "h1").is_none());
        assert!(hcm.list_deploy_keys().is_empty());

        // Deleting an absent entry is not an error.
        hcm.set_host_config(&crm(), "h1", DeploySpec::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn load_parses_keys() {
        let (store, hcm) = setup();
        store
            .update("deploy/expect/h1/java/crm", &DeploySpec::single("v1", 1), 0)
            .await
            .unwrap();
        store
            .update("deploy/expect/h2/redis/cache", &DeploySpec::single("v7", 2), 0)
            .await
            .unwrap();
        hcm.load().await.unwrap();

        assert_eq!(
            hcm.list_deploy_keys(),
            [DeployKey::new("java", "crm"), DeployKey::new("redis", "cache")]
        );
        assert_eq!(
            hcm.get_host_config(&DeployKey::new("redis", "cache"), "h2"),
            Some(DeploySpec::single("v7", 2))
        );
    }

    #[tokio::test]
    async fn bulk_delete() {
        let (_, hcm) = setup();
        for host in ["h1", "h2", "h3"] {
            hcm.set_host_config(&crm(), host, DeploySpec::single("v1", 1))
                .await
                .unwrap();
        }
        hcm.delete_host_configs(&crm(), &["h1".into(), "h3".into(), "h9".into()])
            .await
            .unwrap();
        let left: Vec<_> = hcm.list_host_configs(&crm()).into_keys().collect();
        assert_eq!(left, ["h2"]);
    }

    #[test]
    fn stat_counts_expected_and_legacy() {
        let mut hc = BTreeMap::new();
        hc.insert("h1".to_string(), DeploySpec::single("v2", 1));
        let mut mixed = DeploySpec::single("v1", 2);
        mixed.bump("v2", &BTreeMap::new());
        hc.insert("h2".to_string(), mixed);
        assert_eq!(hc_stat(&hc, "v2"), (2, 2));
        assert_eq!(hc_stat(&BTreeMap::new(), "v2"), (0, 0));
    }
}
