//! Observed process instances, as reported by host agents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeployKey, DeployVer, HostId, InstanceId, ProjectType, Stage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifeCycle {
    #[default]
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    #[default]
    Unknown,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenAddr {
    pub ip: String,
    pub port: u16,
}

/// A probe observation attached to an instance.
///
/// Hard failures go to `conditions`, soft ones to `events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: String,
    pub message: String,
}

impl Finding {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Last sampled resource usage of a process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Resident memory in MiB.
    pub memory: i64,
    pub cpu_percent: f64,
    pub threads: i64,
    pub fds: i64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Outcome of a service-level probe call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeReport {
    pub status: i64,
    pub success: i64,
    pub fail: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JavaPayload {
    pub node_name: String,
    pub main_class: String,
    pub probe: Option<ProbeReport>,
    /// Route group the instance registered under, if any.
    pub route: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisPayload {
    pub port: u16,
    pub role: String,
}

/// Project-type specific part of an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum PrivatePayload {
    Java(JavaPayload),
    Redis(RedisPayload),
    Other(serde_json::Value),
}

impl PrivatePayload {
    /// Decode the raw payload according to the owning instance's type.
    pub fn decode(
        project_type: &ProjectType,
        raw: &serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        if raw.is_null() {
            return Ok(Self::empty(project_type));
        }
        Ok(match project_type.as_str() {
            ProjectType::JAVA => PrivatePayload::Java(serde_json::from_value(raw.clone())?),
            ProjectType::REDIS => PrivatePayload::Redis(serde_json::from_value(raw.clone())?),
            _ => PrivatePayload::Other(raw.clone()),
        })
    }

    pub fn empty(project_type: &ProjectType) -> Self {
        match project_type.as_str() {
            ProjectType::JAVA => PrivatePayload::Java(JavaPayload::default()),
            ProjectType::REDIS => PrivatePayload::Redis(RedisPayload::default()),
            _ => PrivatePayload::Other(serde_json::Value::Null),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        let encoded = match self {
            PrivatePayload::Java(p) => serde_json::to_value(p),
            PrivatePayload::Redis(p) => serde_json::to_value(p),
            PrivatePayload::Other(v) => Ok(v.clone()),
        };
        encoded.unwrap_or(serde_json::Value::Null)
    }
}

/// A running (or recently stopped) service process on some host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub pid: i32,
    pub project_type: ProjectType,
    pub deploy_name: String,
    #[serde(rename = "hostID")]
    pub host_id: HostId,
    pub host: String,
    pub ip: String,
    #[serde(default)]
    pub user: String,
    pub stage: Stage,
    pub version: DeployVer,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    pub life_cycle: LifeCycle,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub listening: Vec<ListenAddr>,
    #[serde(default)]
    pub status: ProbeStatus,
    #[serde(default)]
    pub conditions: Vec<Finding>,
    #[serde(default)]
    pub events: Vec<Finding>,
    #[serde(default)]
    pub res_usage: ResourceUsage,
    /// Raw type-specific payload; see [`Instance::payload`].
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub private: serde_json::Value,
}

impl Instance {
    pub fn deploy_key(&self) -> DeployKey {
        DeployKey::new(self.project_type.clone(), self.deploy_name.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.life_cycle == LifeCycle::Stopped
    }

    pub fn payload(&self) -> Result<PrivatePayload, serde_json::Error> {
        PrivatePayload::decode(&self.project_type, &self.private)
    }

    pub fn set_payload(&mut self, payload: &PrivatePayload) {
        self.private = payload.to_value();
    }

    pub fn started_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.start_time) <= window
    }

    pub fn stopped_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.stop_time
            .is_some_and(|t| now.signed_duration_since(t) <= window)
    }

    /// Derive the overall status from current findings.
    pub fn derive_status(&self) -> ProbeStatus {
        if !self.conditions.is_empty() {
            ProbeStatus::Error
        } else if !self.events.is_empty() {
            ProbeStatus::Warning
        } else {
            ProbeStatus::Success
        }
    }

    /// Minimal record for tests and synthetic reports.
    pub fn sample(key: &DeployKey, id: &str, host_id: &str, version: &str) -> Self {
        Self {
            id: id.to_string(),
            pid: 0,
            project_type: key.project_type.clone(),
            deploy_name: key.name.clone(),
            host_id: host_id.to_string(),
            host: host_id.to_string(),
            ip: "127.0.0.1".to_string(),
            user: String::new(),
            stage: Stage::Dev,
            version: version.to_string(),
            start_time: Utc::now(),
            stop_time: None,
            life_cycle: LifeCycle::Running,
            service_type: String::new(),
            listening: Vec::new(),
            status: ProbeStatus::Unknown,
            conditions: Vec::new(),
            events: Vec::new(),
            res_usage: ResourceUsage::default(),
            private: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_decodes_by_project_type() {
        let key = DeployKey::new("java", "crm");
        let mut ins = Instance::sample(&key, "i-1", "h1", "v1.0.0");
        ins.set_payload(&PrivatePayload::Java(JavaPayload {
            node_name: "node-a".into(),
            ..Default::default()
        }));

        let json = serde_json::to_string(&ins).unwrap();
        assert!(json.contains(r#""hostID":"h1""#));
        let back: Instance = serde_json::from_str(&json).unwrap();
        match back.payload().unwrap() {
            PrivatePayload::Java(p) => assert_eq!(p.node_name, "node-a"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn unknown_type_keeps_raw_payload() {
        let key = DeployKey::new("nginx", "edge");
        let mut ins = Instance::sample(&key, "i-1", "h1", "v1");
        ins.private = serde_json::json!({"workers": 4});
        assert_eq!(
            ins.payload().unwrap(),
            PrivatePayload::Other(serde_json::json!({"workers": 4}))
        );
    }

    #[test]
    fn derive_status_prefers_conditions() {
        let key = DeployKey::new("java", "crm");
        let mut ins = Instance::sample(&key, "i-1", "h1", "v1");
        assert_eq!(ins.derive_status(), ProbeStatus::Success);
        ins.events.push(Finding::new("memory", "high"));
        assert_eq!(ins.derive_status(), ProbeStatus::Warning);
        ins.conditions.push(Finding::new("threads", "over max"));
        assert_eq!(ins.derive_status(), ProbeStatus::Error);
    }

    #[test]
    fn time_windows() {
        let key = DeployKey::new("java", "crm");
        let now = Utc::now();
        let mut ins = Instance::sample(&key, "i-1", "h1", "v1");
        ins.start_time = now - Duration::seconds(30);
        assert!(ins.started_within(Duration::minutes(1), now));
        assert!(!ins.started_within(Duration::seconds(10), now));
        assert!(!ins.stopped_within(Duration::minutes(1), now));
        ins.stop_time = Some(now);
        assert!(ins.stopped_within(Duration::minutes(1), now));
    }
}
