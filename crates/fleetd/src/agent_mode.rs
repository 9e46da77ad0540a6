//! Agent mode — runs on every host.
//!
//! The host id and stage come from the machine id file; `stage_hint` only
//! seeds a file that has no stage yet.

use fleet_agent::{Agent, HostContext, MachineId};
use fleet_core::{FleetConfig, KeySpace};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::store::Backend;

/// Identity of this host, initializing the machine id file if needed.
pub fn identify(config: &FleetConfig, stage_hint: Option<&str>) -> anyhow::Result<HostContext> {
    let machine = MachineId::load_or_init(&config.agent.machine_id_file, stage_hint)?;
    Ok(HostContext::detect(&machine))
}

pub async fn run_agent(
    backend: &Backend,
    config: &FleetConfig,
    host: HostContext,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let keyspace = KeySpace::new(&config.root, host.stage);
    info!(host_id = %host.host_id, stage = %host.stage, prefix = %keyspace.prefix(), "agent mode");
    let store = backend.store(&keyspace.prefix());
    Agent::new(store, keyspace, host, config.agent.clone())
        .run(cancel)
        .await?;
    Ok(())
}
