//! Controller mode — reconciles deploy configs into per-host specs.
//!
//! In this mode, the daemon:
//! 1. Loads the instance index and the host-config cache
//! 2. Follows `deploy/config/` and hands every change to the controller manager
//! 3. Runs one replica controller per deploy key until shutdown

use std::sync::Arc;

use fleet_controller::{ControllerContext, ControllerManager, ControllerSettings, DeployConfigManager};
use fleet_core::{DefaultResources, FleetConfig, KeySpace, Stage};
use fleet_store::Store;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run_controller(
    store: Store,
    config: &FleetConfig,
    stage: Stage,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let keyspace = KeySpace::new(&config.root, stage);
    info!(stage = %stage, prefix = %keyspace.prefix(), "controller starting");

    let settings = ControllerSettings::from(&config.controller);
    let ctx = Arc::new(ControllerContext::new(store.clone(), keyspace, settings));

    // ── Indexes ──────────────────────────────────────────────────
    let infor_task = ctx.infor.start(&cancel).await?;
    ctx.host_configs.load().await?;
    info!("instance index and host configs loaded");

    // ── Config stream ────────────────────────────────────────────
    let configs = DeployConfigManager::new(store, Arc::new(DefaultResources::builtin()), &cancel);
    let changes = configs.start();

    let manager = ControllerManager::new(
        ctx,
        config.controller.max_concurrent,
        config.controller.check_interval(),
    );
    manager.run(changes, cancel.clone()).await;

    configs.destroy();
    let _ = infor_task.await;
    info!("controller stopped");
    Ok(())
}
