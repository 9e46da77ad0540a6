//! Store backend selection and its background upkeep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleet_core::config::{StoreBackendKind, StoreConfig};
use fleet_store::{EmbeddedBackend, EtcdBackend, KvBackend, Store, run_compactor};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

const LEASE_REAP_INTERVAL: Duration = Duration::from_secs(1);
const EMBEDDED_FILE: &str = "fleet.redb";

pub struct Backend {
    kv: Arc<dyn KvBackend>,
    /// Set for the embedded backend, which reaps its own leases.
    embedded: Option<EmbeddedBackend>,
}

impl Backend {
    pub async fn open(cfg: &StoreConfig) -> anyhow::Result<Self> {
        match cfg.backend {
            StoreBackendKind::Etcd => {
                let etcd = EtcdBackend::connect(&cfg.endpoints)
                    .await
                    .with_context(|| format!("connect etcd {:?}", cfg.endpoints))?;
                info!(endpoints = ?cfg.endpoints, "etcd store connected");
                Ok(Self {
                    kv: Arc::new(etcd),
                    embedded: None,
                })
            }
            StoreBackendKind::Embedded => Self::open_embedded(cfg),
        }
    }

    /// Embedded backend regardless of the configured kind.
    pub fn open_embedded(cfg: &StoreConfig) -> anyhow::Result<Self> {
        let embedded = match &cfg.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create data dir {}", dir.display()))?;
                let path = dir.join(EMBEDDED_FILE);
                let backend = EmbeddedBackend::open(&path)
                    .with_context(|| format!("open store {}", path.display()))?;
                info!(path = %path.display(), "embedded store opened");
                backend
            }
            None => {
                info!("embedded store opened in memory");
                EmbeddedBackend::open_in_memory()?
            }
        };
        Ok(Self {
            kv: Arc::new(embedded.clone()),
            embedded: Some(embedded),
        })
    }

    pub fn store(&self, prefix: &str) -> Store {
        Store::new(self.kv.clone(), prefix)
    }

    /// Lease reaping for the embedded backend, and history compaction when
    /// `compact` is set.
    pub fn spawn_upkeep(
        &self,
        cfg: &StoreConfig,
        compact: bool,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        if let Some(embedded) = self.embedded.clone() {
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                embedded.run_lease_reaper(LEASE_REAP_INTERVAL, cancel).await
            }));
        }
        if compact {
            tasks.push(tokio::spawn(run_compactor(
                self.kv.clone(),
                cfg.compact_interval(),
                cancel.clone(),
            )));
        }
        tasks
    }
}
