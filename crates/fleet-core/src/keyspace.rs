//! Key-space schema.
//!
//! Every key lives under `/{root}/{stage}/`. Builders here return keys
//! relative to that prefix; [`KeySpace::prefix`] gives the absolute base a
//! store is opened with.
//!
//! ```text
//! deploy/config/{type}/{name}                       DeployConfig
//! deploy/expect/{hostID}/{type}/{name}              DeploySpec
//! deploy/actual/{hostID}/{type}/{name}/{instanceID} Instance
//! hosts/stat/{hostID}                               HostStatus
//! hosts/info/{hostID}                               HostInfo
//! hosts/config/{hostName}                           HostConfig
//! java/probe/{deployName}                           probe interfaces
//! java/version/{type}/{cluster}                     VersionInfo
//! ```

use crate::types::{DeployKey, HostId, InstanceId, Stage};

pub const DEPLOY_CONFIG: &str = "deploy/config/";
pub const DEPLOY_EXPECT: &str = "deploy/expect/";
pub const DEPLOY_ACTUAL: &str = "deploy/actual/";
pub const HOST_STAT: &str = "hosts/stat/";
pub const HOST_INFO: &str = "hosts/info/";
pub const HOST_CONFIG: &str = "hosts/config/";
pub const JAVA_PROBE: &str = "java/probe/";
pub const JAVA_VERSION: &str = "java/version/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    root: String,
    stage: Stage,
}

impl KeySpace {
    pub fn new(root: &str, stage: Stage) -> Self {
        Self {
            root: root.trim_matches('/').to_string(),
            stage,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// `/{root}/{stage}/`
    pub fn prefix(&self) -> String {
        format!("/{}/{}/", self.root, self.stage)
    }

    pub fn deploy_config(&self, key: &DeployKey) -> String {
        format!("{DEPLOY_CONFIG}{key}")
    }

    pub fn deploy_expect(&self, host: &str, key: &DeployKey) -> String {
        format!("{DEPLOY_EXPECT}{host}/{key}")
    }

    pub fn deploy_expect_host(&self, host: &str) -> String {
        format!("{DEPLOY_EXPECT}{host}/")
    }

    pub fn instance(&self, host: &str, key: &DeployKey, id: &str) -> String {
        format!("{DEPLOY_ACTUAL}{host}/{key}/{id}")
    }

    pub fn instances_on_host(&self, host: &str) -> String {
        format!("{DEPLOY_ACTUAL}{host}/")
    }

    pub fn host_stat(&self, host: &str) -> String {
        format!("{HOST_STAT}{host}")
    }

    pub fn host_info(&self, host: &str) -> String {
        format!("{HOST_INFO}{host}")
    }

    pub fn host_config(&self, host_name: &str) -> String {
        format!("{HOST_CONFIG}{host_name}")
    }

    pub fn probe(&self, deploy_name: &str) -> String {
        format!("{JAVA_PROBE}{deploy_name}")
    }

    pub fn version(&self, project_type: &str, cluster: &str) -> String {
        format!("{JAVA_VERSION}{project_type}/{cluster}")
    }
}

/// Parse `{hostID}/{type}/{name}` (relative to `deploy/expect/`).
pub fn parse_expect_suffix(suffix: &str) -> Option<(HostId, DeployKey)> {
    let mut parts = suffix.trim_start_matches('/').splitn(2, '/');
    let host = parts.next().filter(|h| !h.is_empty())?;
    let key = parts.next()?.parse().ok()?;
    Some((host.to_string(), key))
}

/// Parse `{hostID}/{type}/{name}/{instanceID}` (relative to `deploy/actual/`).
pub fn parse_actual_suffix(suffix: &str) -> Option<(HostId, DeployKey, InstanceId)> {
    let parts: Vec<&str> = suffix.trim_start_matches('/').split('/').collect();
    match parts.as_slice() {
        [host, ty, name, id] if [host, ty, name, id].iter().all(|p| !p.is_empty()) => Some((
            host.to_string(),
            DeployKey::new(*ty, *name),
            id.to_string(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_paths() {
        let ks = KeySpace::new("/deploy/", Stage::Int);
        let key = DeployKey::new("java", "crm");
        assert_eq!(ks.prefix(), "/deploy/int/");
        assert_eq!(ks.deploy_config(&key), "deploy/config/java/crm");
        assert_eq!(ks.deploy_expect("h1", &key), "deploy/expect/h1/java/crm");
        assert_eq!(ks.instance("h1", &key, "i-9"), "deploy/actual/h1/java/crm/i-9");
        assert_eq!(ks.host_stat("h1"), "hosts/stat/h1");
        assert_eq!(ks.host_config("web-01"), "hosts/config/web-01");
        assert_eq!(ks.probe("crm"), "java/probe/crm");
        assert_eq!(ks.version("java", "crm"), "java/version/java/crm");
    }

    #[test]
    fn parses_suffixes() {
        let (host, key) = parse_expect_suffix("h1/java/crm").unwrap();
        assert_eq!(host, "h1");
        assert_eq!(key.to_string(), "java/crm");
        assert!(parse_expect_suffix("h1/java").is_none());
        assert!(parse_expect_suffix("h1/java/crm/extra").is_none());

        let (host, key, id) = parse_actual_suffix("h2/redis/cache/i-1").unwrap();
        assert_eq!((host.as_str(), id.as_str()), ("h2", "i-1"));
        assert_eq!(key, DeployKey::new("redis", "cache"));
        assert!(parse_actual_suffix("h2/redis/cache").is_none());
    }
}
