//! Administrative CRUD over declared deploy configs and cluster versions.

use fleet_core::keyspace::DEPLOY_CONFIG;
use fleet_core::{DeployConfig, DeployKey, KeySpace, VersionInfo, validate_version};
use fleet_store::{Predicate, Store};
use tracing::info;

use crate::error::{ControllerError, ControllerResult};

#[derive(Clone)]
pub struct DeployConfigApi {
    store: Store,
    keyspace: KeySpace,
}

impl DeployConfigApi {
    pub fn new(store: Store, keyspace: KeySpace) -> Self {
        Self { store, keyspace }
    }

    /// Fails with `Exists` when the key is already declared.
    pub async fn create(&self, cfg: &DeployConfig) -> ControllerResult<()> {
        cfg.validate()?;
        let key = cfg.deploy_key();
        self.store
            .create(&self.keyspace.deploy_config(&key), cfg, 0)
            .await?;
        info!(deploy = %key, version = %cfg.expected_version(), "deploy config created");
        Ok(())
    }

    /// Replace an existing config.
    pub async fn update(&self, cfg: &DeployConfig) -> ControllerResult<()> {
        cfg.validate()?;
        let key = cfg.deploy_key();
        let path = self.keyspace.deploy_config(&key);
        if self.store.try_get::<DeployConfig>(&path).await?.is_none() {
            return Err(ControllerError::ConfigNotFound(key));
        }
        self.store.update(&path, cfg, 0).await?;
        info!(deploy = %key, version = %cfg.expected_version(), "deploy config updated");
        Ok(())
    }

    pub async fn delete(&self, key: &DeployKey) -> ControllerResult<DeployConfig> {
        match self.store.delete(&self.keyspace.deploy_config(key)).await {
            Ok(cfg) => {
                info!(deploy = %key, "deploy config deleted");
                Ok(cfg)
            }
            Err(e) if e.is_not_found() => Err(ControllerError::ConfigNotFound(key.clone())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, key: &DeployKey) -> ControllerResult<DeployConfig> {
        self.store
            .try_get(&self.keyspace.deploy_config(key))
            .await?
            .ok_or_else(|| ControllerError::ConfigNotFound(key.clone()))
    }

    pub async fn list(&self) -> ControllerResult<Vec<DeployConfig>> {
        Ok(self.store.list(DEPLOY_CONFIG, &Predicate::everything()).await?)
    }

    /// Promote `version` to expected for a cluster, keeping the previous as backup.
    pub async fn add_version(
        &self,
        project_type: &str,
        cluster: &str,
        version: &str,
    ) -> ControllerResult<VersionInfo> {
        validate_version(version)?;
        let path = self.keyspace.version(project_type, cluster);
        let mut info: VersionInfo = self.store.get_or_default(&path).await?;
        info.add_version(version);
        self.store.update(&path, &info, 0).await?;
        info!(%project_type, %cluster, %version, "cluster version recorded");
        Ok(info)
    }
}
