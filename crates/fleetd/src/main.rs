//! fleetd — the fleet daemon.
//!
//! Single binary that assembles the fleet subsystems:
//! - Store backend (etcd, or embedded redb)
//! - Controller: deploy-config stream, replica controllers, compaction
//! - Agent: process scanner, probes, reporters, converger
//! - ZooKeeper mirrors
//!
//! # Usage
//!
//! ```text
//! fleetd --config /etc/fleet/fleet.toml --stage int controller
//! fleetd --config /etc/fleet/fleet.toml agent
//! fleetd --config /etc/fleet/fleet.toml zk-sync
//! fleetd standalone
//! ```

mod agent_mode;
mod controller_mode;
mod store;
mod zk_sync;

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use fleet_core::{FleetConfig, Stage};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::store::Backend;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleet=debug";
const STAGE_ENV: &str = "ENV";

#[derive(Parser, Debug)]
#[command(name = "fleetd", about = "Fleet deployment daemon")]
struct Cli {
    /// Path to fleet.toml. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Stage to operate on. Overrides the config file and the ENV variable.
    #[arg(long, global = true)]
    stage: Option<Stage>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Reconcile deploy configs into per-host specs.
    Controller,
    /// Run the host agent.
    Agent,
    /// Mirror ZooKeeper trees into the store.
    ZkSync,
    /// Embedded store, controller and agent in one process.
    Standalone,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("load config {}", path.display())),
        None => Ok(FleetConfig::default()),
    }
}

/// `--stage`, then the config file, then `ENV`.
fn resolve_stage(
    flag: Option<Stage>,
    configured: Option<Stage>,
    env: Option<String>,
) -> anyhow::Result<Stage> {
    if let Some(stage) = flag.or(configured) {
        return Ok(stage);
    }
    let raw = env
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow!("no stage: pass --stage, set `stage` in the config or {STAGE_ENV}"))?;
    raw.parse::<Stage>()
        .with_context(|| format!("{STAGE_ENV}={raw}"))
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = ctrl_c.await;
        }
    }
    info!("shutdown signal received");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(cli.config.as_deref())?;
    let stage = resolve_stage(cli.stage, config.stage, std::env::var(STAGE_ENV).ok());

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    match cli.command {
        Command::Controller => {
            let stage = stage?;
            let backend = Backend::open(&config.store).await?;
            let upkeep = backend.spawn_upkeep(&config.store, true, &cancel);
            let store = backend.store(&fleet_core::KeySpace::new(&config.root, stage).prefix());
            controller_mode::run_controller(store, &config, stage, cancel.clone()).await?;
            cancel.cancel();
            for task in upkeep {
                let _ = task.await;
            }
        }
        Command::Agent => {
            let hint = stage.ok().map(|s| s.to_string());
            let host = agent_mode::identify(&config, hint.as_deref())?;
            let backend = Backend::open(&config.store).await?;
            let upkeep = backend.spawn_upkeep(&config.store, false, &cancel);
            agent_mode::run_agent(&backend, &config, host, cancel.clone()).await?;
            cancel.cancel();
            for task in upkeep {
                let _ = task.await;
            }
        }
        Command::ZkSync => {
            let backend = Backend::open(&config.store).await?;
            let upkeep = backend.spawn_upkeep(&config.store, false, &cancel);
            let result = zk_sync::run_zk_sync(backend.store("/"), &config.zk, cancel.clone()).await;
            cancel.cancel();
            for task in upkeep {
                let _ = task.await;
            }
            result?;
        }
        Command::Standalone => run_standalone(&config, stage.ok(), cancel).await?,
    }
    Ok(())
}

async fn run_standalone(
    config: &FleetConfig,
    stage: Option<Stage>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!("fleet daemon starting in standalone mode");
    let hint = stage.map(|s| s.to_string());
    let host = agent_mode::identify(config, hint.as_deref())?;
    if stage.is_some_and(|s| s != host.stage) {
        warn!(requested = ?stage, machine = %host.stage, "machine id file decides the stage");
    }
    let stage = host.stage;

    let backend = Backend::open_embedded(&config.store)?;
    let upkeep = backend.spawn_upkeep(&config.store, true, &cancel);
    let store = backend.store(&fleet_core::KeySpace::new(&config.root, stage).prefix());

    let result = tokio::try_join!(
        controller_mode::run_controller(store, config, stage, cancel.clone()),
        agent_mode::run_agent(&backend, config, host, cancel.clone()),
    );
    cancel.cancel();
    for task in upkeep {
        let _ = task.await;
    }
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_and_global_flags() {
        let cli = Cli::try_parse_from(["fleetd", "--stage", "INT", "agent", "--log-json"]).unwrap();
        assert_eq!(cli.command, Command::Agent);
        assert_eq!(cli.stage, Some(Stage::Int));
        assert!(cli.log_json);

        let cli = Cli::try_parse_from(["fleetd", "zk-sync", "--config", "/etc/fleet/fleet.toml"]).unwrap();
        assert_eq!(cli.command, Command::ZkSync);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/fleet/fleet.toml")));

        assert!(Cli::try_parse_from(["fleetd", "--stage", "moon", "controller"]).is_err());
        assert!(Cli::try_parse_from(["fleetd"]).is_err());
    }

    #[test]
    fn stage_precedence() {
        let env = || Some("dev".to_string());
        assert_eq!(resolve_stage(Some(Stage::Int), Some(Stage::Dev), env()).unwrap(), Stage::Int);
        assert_eq!(resolve_stage(None, Some(Stage::Int), env()).unwrap(), Stage::Int);
        assert_eq!(resolve_stage(None, None, env()).unwrap(), Stage::Dev);
        assert!(resolve_stage(None, None, None).is_err());
        assert!(resolve_stage(None, None, Some("nowhere".into())).is_err());
    }

    #[test]
    fn default_filter_is_valid() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn config_file_is_optional() {
        assert_eq!(load_config(None).unwrap().root, "deploy");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "root = \"fleet\"\n[agent]\nscan_interval_secs = 2\n").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.root, "fleet");
        assert_eq!(cfg.agent.scan_interval_secs, 2);

        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
