//! fleet.toml configuration parser.
//!
//! ```toml
//! stage = "int"
//! root = "deploy"
//!
//! [store]
//! backend = "etcd"
//! endpoints = ["http://10.0.0.1:2379"]
//!
//! [controller]
//! max_concurrent = 16
//!
//! [[zk.env]]
//! stage = "int"
//! addr = "zk1:2181,zk2:2181"
//! [[zk.env.base]]
//! path = "/biz"
//! allow = ["^/biz/[^/]+/[^/]+/(policy|config)(/.*)?$"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Stage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Falls back to the `ENV` environment variable when absent.
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub zk: ZkConfig,
}

fn default_root() -> String {
    "deploy".to_string()
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            stage: None,
            root: default_root(),
            store: StoreConfig::default(),
            controller: ControllerConfig::default(),
            agent: AgentConfig::default(),
            zk: ZkConfig::default(),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Etcd,
    #[default]
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    pub endpoints: Vec<String>,
    /// Embedded backend file; in-memory when unset.
    pub data_dir: Option<PathBuf>,
    pub compact_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            data_dir: None,
            compact_interval_secs: 300,
        }
    }
}

impl StoreConfig {
    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Reconciliation passes allowed in flight at once.
    pub max_concurrent: usize,
    pub check_interval_secs: u64,
    pub wait_instance_up: bool,
    pub onetime_window_secs: u64,
    pub running_window_secs: u64,
    /// Overrides the per-config timeout as the legacy-version lease.
    pub legacy_version_timeout_secs: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            check_interval_secs: 60,
            wait_instance_up: true,
            onetime_window_secs: 10,
            running_window_secs: 120,
            legacy_version_timeout_secs: None,
        }
    }
}

impl ControllerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub machine_id_file: PathBuf,
    pub ctrl_script: PathBuf,
    pub proc_root: PathBuf,
    pub scan_interval_secs: u64,
    pub stopped_retention_secs: u64,
    pub host_stat_ttl_secs: i64,
    /// Daily disk-write budget in MiB, extrapolated from a 5 minute window.
    pub disk_write_mb_per_day: u64,
    pub labels: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            machine_id_file: PathBuf::from("/etc/fleet/machine-id"),
            ctrl_script: PathBuf::from("/opt/fleet/ctrl.sh"),
            proc_root: PathBuf::from("/proc"),
            scan_interval_secs: 5,
            stopped_retention_secs: 300,
            host_stat_ttl_secs: 30,
            disk_write_mb_per_day: 200 * 1024,
            labels: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZkConfig {
    /// Store root the mirrored trees land under.
    pub root: String,
    pub dial_timeout_secs: u64,
    pub env: Vec<ZkEnvConfig>,
}

impl Default for ZkConfig {
    fn default() -> Self {
        Self {
            root: "/mnt/zk".to_string(),
            dial_timeout_secs: 10,
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZkEnvConfig {
    pub stage: Stage,
    pub addr: String,
    #[serde(default)]
    pub base: Vec<ZkBaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZkBaseConfig {
    pub path: String,
    /// Regexes a ZooKeeper path must match to be mirrored. Empty allows all.
    #[serde(default)]
    pub allow: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_valid() {
        let cfg = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.root, "deploy");
        assert_eq!(cfg.store.backend, StoreBackendKind::Embedded);
        assert_eq!(cfg.controller.max_concurrent, 16);
        assert_eq!(cfg.agent.scan_interval(), Duration::from_secs(5));
        assert_eq!(cfg.zk.root, "/mnt/zk");
    }

    #[test]
    fn parses_full_file() {
        let toml = r#"
            stage = "int"

            [store]
            backend = "etcd"
            endpoints = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]

            [controller]
            max_concurrent = 4
            legacy_version_timeout_secs = 900

            [agent]
            ctrl_script = "/usr/local/bin/ctrl.sh"
            labels = { zone = "east" }

            [[zk.env]]
            stage = "int"
            addr = "zk1:2181"

            [[zk.env.base]]
            path = "/biz"
            allow = ["^/biz/.*$"]
        "#;
        let cfg = FleetConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.stage, Some(Stage::Int));
        assert_eq!(cfg.store.backend, StoreBackendKind::Etcd);
        assert_eq!(cfg.store.endpoints.len(), 2);
        assert_eq!(cfg.controller.max_concurrent, 4);
        assert_eq!(cfg.controller.legacy_version_timeout_secs, Some(900));
        assert_eq!(cfg.agent.labels.get("zone").map(String::as_str), Some("east"));
        assert_eq!(cfg.zk.env[0].base[0].path, "/biz");
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "stage = \"prd\"\nroot = \"fleet\"\n").unwrap();
        let cfg = FleetConfig::from_file(&path).unwrap();
        assert_eq!(cfg.stage, Some(Stage::Prd));
        assert_eq!(cfg.root, "fleet");
    }
}
