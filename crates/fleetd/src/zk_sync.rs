//! ZooKeeper sync mode — one supervised mirror per configured environment.
//!
//! A mirror that keeps failing exhausts its restart budget; the daemon then
//! stops every mirror and exits non-zero so the service manager notices.

use anyhow::bail;
use fleet_core::config::ZkConfig;
use fleet_store::Store;
use fleet_zk::{RestartBudget, ZkError, supervise, sync_env};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub async fn run_zk_sync(store: Store, zk: &ZkConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    if zk.env.is_empty() {
        bail!("no [[zk.env]] entries configured");
    }

    let mut mirrors = JoinSet::new();
    for env in zk.env.clone() {
        let zk = zk.clone();
        let store = store.clone();
        let cancel = cancel.clone();
        mirrors.spawn(async move {
            let name = format!("zk-sync/{}", env.stage);
            info!(mirror = %name, addr = %env.addr, bases = env.base.len(), "mirror starting");
            let result = supervise(&name, &cancel, RestartBudget::default(), || {
                sync_env(&env, &zk, &store, &cancel)
            })
            .await;
            (name, result)
        });
    }

    let mut failure: Option<ZkError> = None;
    while let Some(joined) = mirrors.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(mirror = %name, "mirror stopped"),
            Ok((name, Err(e))) => {
                error!(mirror = %name, error = %e, "mirror gave up");
                cancel.cancel();
                failure.get_or_insert(e);
            }
            Err(e) => {
                error!(error = %e, "mirror task panicked");
                cancel.cancel();
            }
        }
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
