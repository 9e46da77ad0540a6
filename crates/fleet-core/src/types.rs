//! Identity types: stages, project types and deploy keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Opaque version string, compared by equality only.
pub type DeployVer = String;

/// Stable per-machine identifier (a UUID persisted in the machine-id file).
pub type HostId = String;

/// Identifier of one observed process instance.
pub type InstanceId = String;

/// Environment tag partitioning every other entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Dev,
    Test,
    Qa,
    Int,
    Prd,
}

impl Stage {
    pub const ALL: [Stage; 5] = [Stage::Dev, Stage::Test, Stage::Qa, Stage::Int, Stage::Prd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Dev => "dev",
            Stage::Test => "test",
            Stage::Qa => "qa",
            Stage::Int => "int",
            Stage::Prd => "prd",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::Parse(format!("unknown stage {s:?}")))
    }
}

/// Open-ended project type tag such as `java` or `redis`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectType(String);

impl ProjectType {
    pub const JAVA: &'static str = "java";
    pub const REDIS: &'static str = "redis";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn java() -> Self {
        Self::new(Self::JAVA)
    }

    pub fn redis() -> Self {
        Self::new(Self::REDIS)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl PartialEq<str> for ProjectType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Primary key of a declared deployment: `{type}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeployKey {
    pub project_type: ProjectType,
    pub name: String,
}

impl DeployKey {
    pub fn new(project_type: impl Into<ProjectType>, name: impl Into<String>) -> Self {
        Self {
            project_type: project_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeployKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_type, self.name)
    }
}

impl FromStr for DeployKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ty, name)) if !ty.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(DeployKey::new(ty, name))
            }
            _ => Err(CoreError::Parse(format!(
                "invalid deploy key {s:?}, expected type/name"
            ))),
        }
    }
}

impl TryFrom<String> for DeployKey {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeployKey> for String {
    fn from(key: DeployKey) -> Self {
        key.to_string()
    }
}

impl From<String> for ProjectType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_parses_case_insensitively() {
        assert_eq!("PRD".parse::<Stage>().unwrap(), Stage::Prd);
        assert_eq!("int".parse::<Stage>().unwrap(), Stage::Int);
        assert!("staging".parse::<Stage>().is_err());
    }

    #[test]
    fn deploy_key_round_trips() {
        for raw in ["java/crm", "redis/cache-01", "java/foo:bar"] {
            let key: DeployKey = raw.parse().unwrap();
            assert_eq!(key.to_string(), raw);
        }
    }

    #[test]
    fn deploy_key_rejects_malformed() {
        for raw in ["java", "/crm", "java/", "java/a/b", ""] {
            assert!(raw.parse::<DeployKey>().is_err(), "{raw} should fail");
        }
    }

    #[test]
    fn deploy_key_serializes_as_string() {
        let key = DeployKey::new("java", "crm");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"java/crm\"");
        let back: DeployKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
