//! Project-type handlers: how to recognise, describe and probe a process.

pub mod java;
pub mod redis;

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::{
    DeployKey, HostId, Instance, LifeCycle, ProbeReport, ProbeStatus, ProjectType, ResourceUsage,
    Stage,
};
use tracing::debug;

use crate::error::AgentResult;
use crate::identify::Identifier;
use crate::proc::ProcInfo;

pub use java::JavaHandler;
pub use redis::RedisHandler;

/// Environment variables the converger passes to processes it starts.
pub const ENV_DEPLOY_KEY: &str = "_depolyKey";
pub const ENV_VERSION: &str = "_version";
pub const ENV_NODE_NAME: &str = "_nodeName";
pub const ENV_INSTANCE_ID: &str = "_instanceID";

pub const UNKNOWN_VERSION: &str = "unknown";

/// Where the agent runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    pub host_id: HostId,
    pub host_name: String,
    pub ip: String,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Warning(String),
    Failure(String),
}

impl ProbeOutcome {
    pub fn status(&self) -> ProbeStatus {
        match self {
            ProbeOutcome::Success => ProbeStatus::Success,
            ProbeOutcome::Warning(_) => ProbeStatus::Warning,
            ProbeOutcome::Failure(_) => ProbeStatus::Error,
        }
    }
}

/// One service-level probe call and its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCall {
    /// Interface or endpoint name.
    pub name: String,
    pub outcome: ProbeOutcome,
    pub report: Option<ProbeReport>,
}

#[async_trait]
pub trait ProjectHandler: Send + Sync {
    fn project_type(&self) -> ProjectType;

    fn identifier(&self) -> Identifier;

    /// Fill in what [`skeleton`] could not take from the environment.
    fn parse(&self, proc: &ProcInfo, host: &HostContext, ins: &mut Instance) -> AgentResult<()>;

    /// Service-level checks. Empty when there is nothing to call yet.
    async fn probe(&self, ins: &Instance) -> Vec<ProbeCall>;
}

/// Instance record for a newly seen process, with the `_…` environment
/// overrides applied.
pub fn skeleton(proc: &ProcInfo, project_type: ProjectType, host: &HostContext) -> Instance {
    let env = |k: &str| proc.env.get(k).filter(|v| !v.is_empty()).cloned();

    let deploy_name = match env(ENV_DEPLOY_KEY) {
        Some(raw) => match raw.parse::<DeployKey>() {
            Ok(key) => {
                if key.project_type != project_type {
                    debug!(pid = proc.pid, %key, %project_type, "deploy key type differs from identified type");
                }
                key.name
            }
            Err(_) => raw,
        },
        None => String::new(),
    };

    Instance {
        id: env(ENV_INSTANCE_ID).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        pid: proc.pid,
        project_type,
        deploy_name,
        host_id: host.host_id.clone(),
        host: host.host_name.clone(),
        ip: host.ip.clone(),
        user: String::new(),
        stage: host.stage,
        version: env(ENV_VERSION).unwrap_or_default(),
        start_time: Utc::now(),
        stop_time: None,
        life_cycle: LifeCycle::Starting,
        service_type: String::new(),
        listening: Vec::new(),
        status: ProbeStatus::Unknown,
        conditions: Vec::new(),
        events: Vec::new(),
        res_usage: ResourceUsage::default(),
        private: serde_json::Value::Null,
    }
}


#[cfg(test)]
mod tests {
    use super::test_host::{host, proc};
    use super::*;

    #[test]
    fn environment_overrides() {
        let p = proc(
            "/usr/bin/java",
            &["java"],
            &[
                (ENV_DEPLOY_KEY, "java/foo:bar"),
                (ENV_VERSION, "v7"),
                (ENV_INSTANCE_ID, "ins-9"),
            ],
        );
        let ins = skeleton(&p, ProjectType::java(), &host());
        assert_eq!(ins.deploy_name, "foo:bar");
        assert_eq!(ins.version, "v7");
        assert_eq!(ins.id, "ins-9");
        assert_eq!(ins.host_id, "h1");
        assert_eq!(ins.life_cycle, LifeCycle::Starting);

        let bare = skeleton(&proc("/usr/bin/java", &["java"], &[]), ProjectType::java(), &host());
        assert!(bare.deploy_name.is_empty());
        assert!(uuid::Uuid::parse_str(&bare.id).is_ok());
    }
}
