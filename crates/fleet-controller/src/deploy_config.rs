//! Deploy-config manager — watched cache of declared deployments.
//!
//! Follows `deploy/config/` and forwards every change as a [`ConfigChange`].
//! Reads fill in the project type's medium resource tier when a config does
//! not declare its own requirement.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use fleet_core::keyspace::DEPLOY_CONFIG;
use fleet_core::{DefaultResources, DeployConfig, DeployKey};
use fleet_store::{Predicate, Store, WatchEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHANGE_CHANNEL_SIZE: usize = 64;
const RESYNC_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    Upsert(DeployConfig),
    Removed(DeployKey),
}

#[derive(Clone)]
pub struct DeployConfigManager {
    store: Store,
    defaults: Arc<DefaultResources>,
    configs: Arc<RwLock<BTreeMap<DeployKey, DeployConfig>>>,
    cancel: CancellationToken,
}

impl DeployConfigManager {
    pub fn new(store: Store, defaults: Arc<DefaultResources>, parent: &CancellationToken) -> Self {
        Self {
            store,
            defaults,
            configs: Arc::new(RwLock::new(BTreeMap::new())),
            cancel: parent.child_token(),
        }
    }

    /// Spawn the watch task. The returned receiver first sees every stored
    /// config as an `Upsert`.
    pub fn start(&self) -> mpsc::Receiver<ConfigChange> {
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_SIZE);
        let manager = self.clone();
        tokio::spawn(async move { manager.run(tx).await });
        rx
    }

    /// Stop the watch task. The change channel closes shortly after.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    pub fn get(&self, key: &DeployKey) -> Option<DeployConfig> {
        let configs = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        configs.get(key).cloned().map(|cfg| self.with_defaults(cfg))
    }

    pub fn list(&self) -> Vec<DeployConfig> {
        let configs = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        configs
            .values()
            .cloned()
            .map(|cfg| self.with_defaults(cfg))
            .collect()
    }

    fn with_defaults(&self, mut cfg: DeployConfig) -> DeployConfig {
        if cfg.resource_required.is_none() {
            cfg.resource_required = self.defaults.medium(&cfg.project_type);
        }
        cfg
    }

    async fn run(self, tx: mpsc::Sender<ConfigChange>) {
        let mut first = true;
        loop {
            if !first && !self.resync(&tx).await {
                return;
            }
            first = false;

            let mut stream = match self
                .store
                .watch::<DeployConfig>(DEPLOY_CONFIG, Predicate::everything(), true, &self.cancel)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "deploy config watch failed to start");
                    if !self.pause().await {
                        return;
                    }
                    continue;
                }
            };
            info!("watching deploy configs");

            loop {
                let event = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    event = stream.recv() => event,
                };
                let change = match event {
                    Some(WatchEvent::Added { key, object }) | Some(WatchEvent::Modified { key, object }) => {
                        self.upsert(&key, object)
                    }
                    Some(WatchEvent::Deleted { key, .. }) => self.remove(&key),
                    Some(WatchEvent::Error(e)) => {
                        warn!(error = %e, "deploy config watch broke, resyncing");
                        break;
                    }
                    None => break,
                };
                if let Some(change) = change {
                    if tx.send(change).await.is_err() {
                        debug!("config change receiver dropped");
                        return;
                    }
                }
            }

            if !self.pause().await {
                return;
            }
        }
    }

    fn upsert(&self, path: &str, cfg: DeployConfig) -> Option<ConfigChange> {
        let key = cfg.deploy_key();
        if key.to_string() != path {
            warn!(%path, deploy = %key, "deploy config stored under a foreign key, ignored");
            return None;
        }
        if let Err(e) = cfg.validate() {
            warn!(deploy = %key, error = %e, "invalid deploy config ignored");
            return None;
        }
        let mut configs = self.configs.write().unwrap_or_else(PoisonError::into_inner);
        configs.insert(key, cfg.clone());
        drop(configs);
        Some(ConfigChange::Upsert(self.with_defaults(cfg)))
    }

    fn remove(&self, path: &str) -> Option<ConfigChange> {
        let key: DeployKey = match path.parse() {
            Ok(key) => key,
            Err(_) => {
                warn!(%path, "malformed deploy config key");
                return None;
            }
        };
        let mut configs = self.configs.write().unwrap_or_else(PoisonError::into_inner);
        configs.remove(&key).map(|_| ConfigChange::Removed(key))
    }

    /// After a broken watch, report configs deleted while we were away.
    ///
    /// Presence is judged on raw keys so a config that stopped decoding is
    /// kept rather than torn down.
    async fn resync(&self, tx: &mpsc::Sender<ConfigChange>) -> bool {
        let listed = match self
            .store
            .list_map::<Vec<u8>>(DEPLOY_CONFIG, &Predicate::everything())
            .await
        {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "deploy config resync failed");
                return true;
            }
        };
        let gone: Vec<DeployKey> = {
            let configs = self.configs.read().unwrap_or_else(PoisonError::into_inner);
            configs
                .keys()
                .filter(|key| !listed.contains_key(&key.to_string()))
                .cloned()
                .collect()
        };
        for key in gone {
            if let Some(change) = self.remove(&key.to_string()) {
                if tx.send(change).await.is_err() {
                    return false;
                }
            }
        }
        true
    }

    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(RESYNC_DELAY) => true,
        }
    }
}
