//! Controller manager — keeps one replica controller per declared key.
//!
//! Config changes start a fresh reconciliation pass (cancelling the one in
//! flight). A periodic tick audits every controller and re-runs idle ones.
//! At most `max_concurrent` passes run at once; a refused pass is retried on
//! the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{DeployConfig, DeployKey};
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ControllerContext;
use crate::deploy_config::ConfigChange;
use crate::error::{ControllerError, ControllerResult};
use crate::replica::ReplicaController;

struct PassHandle {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct ControllerSlot {
    controller: Arc<ReplicaController>,
    config: DeployConfig,
    pass: Option<PassHandle>,
    /// Refused for concurrency; retried on the next tick.
    pending: bool,
}

pub struct ControllerManager {
    ctx: Arc<ControllerContext>,
    slots: Arc<RwLock<HashMap<DeployKey, ControllerSlot>>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    check_interval: Duration,
}

impl ControllerManager {
    pub fn new(ctx: Arc<ControllerContext>, max_concurrent: usize, check_interval: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            ctx,
            slots: Arc::new(RwLock::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            check_interval,
        }
    }

    /// Consume config changes until cancelled or the stream closes.
    pub async fn run(&self, mut changes: mpsc::Receiver<ConfigChange>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!(max_concurrent = self.max_concurrent, interval = ?self.check_interval, "controller manager started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Some(ConfigChange::Upsert(config)) => {
                        if let Err(e) = self.apply(config, &cancel).await {
                            debug!(error = %e, "pass deferred");
                        }
                    }
                    Some(ConfigChange::Removed(key)) => self.remove(&key).await,
                    None => {
                        info!("config change stream closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.tick(&cancel).await,
            }
        }
        self.stop_all().await;
        info!("controller manager stopped");
    }

    /// Start a pass for `config` unless the same config already had one.
    pub async fn apply(&self, config: DeployConfig, cancel: &CancellationToken) -> ControllerResult<()> {
        let key = config.deploy_key();
        let mut slots = self.slots.write().await;
        let slot = slots.entry(key.clone()).or_insert_with(|| {
            info!(deploy = %key, "controller created");
            ControllerSlot {
                controller: Arc::new(ReplicaController::new(key.clone(), self.ctx.clone())),
                config: config.clone(),
                pass: None,
                pending: false,
            }
        });
        if slot.config == config && slot.pass.is_some() && !slot.pending {
            debug!(deploy = %key, "config unchanged");
            return Ok(());
        }
        slot.config = config;
        self.start_pass(&key, slot, cancel).await
    }

    /// The previous pass is cancelled and awaited first, so its permit is
    /// free again before this one asks for one.
    async fn start_pass(
        &self,
        key: &DeployKey,
        slot: &mut ControllerSlot,
        cancel: &CancellationToken,
    ) -> ControllerResult<()> {
        if let Some(prev) = slot.pass.take() {
            if !prev.handle.is_finished() {
                debug!(deploy = %key, "cancelling in-flight pass");
            }
            prev.cancel.cancel();
            let _ = prev.handle.await;
        }
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            slot.pending = true;
            warn!(deploy = %key, limit = self.max_concurrent, "too many passes in flight, deferring");
            return Err(ControllerError::ConcurrencyFull(self.max_concurrent));
        };
        slot.pending = false;

        let token = cancel.child_token();
        let controller = slot.controller.clone();
        let config = slot.config.clone();
        let pass_cancel = token.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            match controller.deploy(&config, &pass_cancel).await {
                Ok(()) => {}
                Err(ControllerError::Cancelled) => debug!(deploy = %controller.key(), "pass cancelled"),
                Err(e) => warn!(deploy = %controller.key(), error = %e, "pass failed"),
            }
        });
        slot.pass = Some(PassHandle {
            handle,
            cancel: token,
        });
        Ok(())
    }

    /// Tear down the controller of a removed config.
    pub async fn remove(&self, key: &DeployKey) {
        let slot = self.slots.write().await.remove(key);
        let Some(slot) = slot else {
            return;
        };
        if let Some(pass) = slot.pass {
            pass.cancel.cancel();
        }
        match slot.controller.destroy().await {
            Ok(()) => info!(deploy = %key, "controller removed"),
            Err(e) => warn!(deploy = %key, error = %e, "controller teardown incomplete"),
        }
    }

    async fn tick(&self, cancel: &CancellationToken) {
        let mut slots = self.slots.write().await;
        for (key, slot) in slots.iter_mut() {
            if slot.pass.as_ref().is_some_and(|p| !p.handle.is_finished()) {
                continue;
            }
            if let Err(e) = slot.controller.check_status() {
                info!(deploy = %key, divergence = %e, "audit found divergence");
            }
            if let Err(e) = self.start_pass(key, slot, cancel).await {
                debug!(deploy = %key, error = %e, "periodic pass deferred");
            }
        }
    }

    /// Cancel every pass. Host configs are left in place.
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        for (key, slot) in slots.iter_mut() {
            if let Some(pass) = slot.pass.take() {
                pass.cancel.cancel();
                debug!(deploy = %key, "pass stopped");
            }
        }
    }

    pub async fn controller(&self, key: &DeployKey) -> Option<Arc<ReplicaController>> {
        self.slots.read().await.get(key).map(|s| s.controller.clone())
    }

    pub async fn deploy_keys(&self) -> Vec<DeployKey> {
        let mut keys: Vec<_> = self.slots.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a pass for `key` is currently running.
    pub async fn is_running(&self, key: &DeployKey) -> bool {
        self.slots
            .read()
            .await
            .get(key)
            .and_then(|s| s.pass.as_ref())
            .is_some_and(|p| !p.handle.is_finished())
    }
}
