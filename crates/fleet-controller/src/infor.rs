//! Instance infor — in-memory index of reported instances.
//!
//! Lists `deploy/actual/` once, then follows a recursive watch. Readers get
//! cloned snapshots under a read lock; only the watch task writes.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use fleet_core::keyspace::{DEPLOY_ACTUAL, parse_actual_suffix};
use fleet_core::{DeployKey, Instance, InstanceId};
use fleet_store::{Predicate, Store, WatchEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ControllerResult;

/// Back-off before re-listing after the watch stream failed.
const RESYNC_DELAY: Duration = Duration::from_secs(1);

type Index = HashMap<DeployKey, HashMap<InstanceId, Instance>>;

#[derive(Clone)]
pub struct InstanceInfor {
    store: Store,
    index: Arc<RwLock<Index>>,
}

impl InstanceInfor {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            index: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Populate the index and spawn the watch task. The index is complete
    /// when this returns.
    pub async fn start(&self, cancel: &CancellationToken) -> ControllerResult<JoinHandle<()>> {
        self.resync().await?;
        let infor = self.clone();
        let cancel = cancel.clone();
        Ok(tokio::spawn(async move { infor.run(cancel).await }))
    }

    async fn resync(&self) -> ControllerResult<()> {
        let listed = self
            .store
            .list_map::<Instance>(DEPLOY_ACTUAL, &Predicate::everything())
            .await?;
        let mut fresh = Index::new();
        for (suffix, ins) in listed {
            let Some((_, key, id)) = parse_actual_suffix(&suffix) else {
                warn!(key = %suffix, "ignoring malformed instance key");
                continue;
            };
            fresh.entry(key).or_default().insert(id, ins);
        }
        let total: usize = fresh.values().map(HashMap::len).sum();
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        info!(instances = total, "instance index loaded");
        Ok(())
    }

    async fn run(self, cancel: CancellationToken) {
        loop {
            let mut stream = match self
                .store
                .watch::<Instance>(DEPLOY_ACTUAL, Predicate::everything(), true, &cancel)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "instance watch failed to start");
                    if !self.pause(&cancel).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = stream.recv() => event,
                };
                match event {
                    Some(WatchEvent::Error(e)) => {
                        warn!(error = %e, "instance watch broke, resyncing");
                        break;
                    }
                    Some(event) => self.apply(event),
                    None => break,
                }
            }

            if !self.pause(&cancel).await {
                return;
            }
            if let Err(e) = self.resync().await {
                warn!(error = %e, "instance resync failed");
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(RESYNC_DELAY) => true,
        }
    }

    /// Fold one watch event into the index.
    pub fn apply(&self, event: WatchEvent<Instance>) {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            WatchEvent::Added { key, object } | WatchEvent::Modified { key, object } => {
                let Some((_, deploy, id)) = parse_actual_suffix(&key) else {
                    warn!(%key, "ignoring malformed instance key");
                    return;
                };
                index.entry(deploy).or_default().insert(id, object);
            }
            WatchEvent::Deleted { key, object } => {
                let Some((host, deploy, id)) = parse_actual_suffix(&key) else {
                    return;
                };
                let removed = index.get_mut(&deploy).and_then(|m| m.remove(&id));
                if index.get(&deploy).is_some_and(HashMap::is_empty) {
                    index.remove(&deploy);
                }
                let last = object.or(removed);
                match last {
                    Some(ins) if !ins.is_stopped() => warn!(
                        deploy = %deploy,
                        %host,
                        instance = %id,
                        life_cycle = ?ins.life_cycle,
                        "instance removed before it stopped"
                    ),
                    _ => debug!(deploy = %deploy, %host, instance = %id, "instance removed"),
                }
            }
            WatchEvent::Error(_) => {}
        }
    }

    fn select(&self, key: &DeployKey, keep: impl Fn(&Instance) -> bool) -> Vec<Instance> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Instance> = index
            .get(key)
            .map(|m| m.values().filter(|i| keep(i)).cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn running_instances(&self, key: &DeployKey) -> Vec<Instance> {
        self.select(key, |i| !i.is_stopped())
    }

    pub fn recent_stopped_instances(&self, key: &DeployKey) -> Vec<Instance> {
        self.select(key, Instance::is_stopped)
    }

    pub fn new_started_instances(&self, key: &DeployKey, within: chrono::Duration) -> Vec<Instance> {
        let now = Utc::now();
        self.select(key, |i| i.started_within(within, now))
    }

    pub fn new_stopped_instances(&self, key: &DeployKey, within: chrono::Duration) -> Vec<Instance> {
        let now = Utc::now();
        self.select(key, |i| i.stopped_within(within, now))
    }

    pub fn get_instance(&self, key: &DeployKey, id: &str) -> Option<Instance> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.get(key).and_then(|m| m.get(id)).cloned()
    }

    pub fn deploy_keys(&self) -> Vec<DeployKey> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = index.keys().cloned().collect();
        keys.sort();
        keys
    }
}
