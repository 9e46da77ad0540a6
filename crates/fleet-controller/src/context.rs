//! Shared handles every replica controller works against.

use std::time::Duration;

use fleet_core::KeySpace;
use fleet_core::config::ControllerConfig;
use fleet_store::Store;

use crate::host_config::HostConfigManager;
use crate::infor::InstanceInfor;
use crate::wait::WaitPolicy;

#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    pub wait: WaitPolicy,
    /// Replaces each config's update timeout as the legacy-version lease.
    pub legacy_timeout: Option<Duration>,
    /// Fixed scheduler seed, for reproducible placement in tests.
    pub scheduler_seed: Option<u64>,
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(cfg: &ControllerConfig) -> Self {
        Self {
            wait: WaitPolicy {
                enabled: cfg.wait_instance_up,
                onetime_window: chrono::Duration::seconds(cfg.onetime_window_secs as i64),
                running_window: chrono::Duration::seconds(cfg.running_window_secs as i64),
            },
            legacy_timeout: cfg.legacy_version_timeout_secs.map(Duration::from_secs),
            scheduler_seed: None,
        }
    }
}

#[derive(Clone)]
pub struct ControllerContext {
    pub store: Store,
    pub keyspace: KeySpace,
    pub infor: InstanceInfor,
    pub host_configs: HostConfigManager,
    pub settings: ControllerSettings,
}

impl ControllerContext {
    pub fn new(store: Store, keyspace: KeySpace, settings: ControllerSettings) -> Self {
        Self {
            infor: InstanceInfor::new(store.clone()),
            host_configs: HostConfigManager::new(store.clone(), keyspace.clone()),
            store,
            keyspace,
            settings,
        }
    }
}
