//! Machine identity persisted in a small `key=value` file.
//!
//! ```text
//! hostID=3f0c…
//! stage=int
//! ```
//!
//! A missing `hostID` is generated once; a missing `stage` comes from the
//! `ENV` environment variable. Either way the file is rewritten so the next
//! start sees the same identity.

use std::collections::BTreeMap;
use std::path::Path;

use fleet_core::{HostId, Stage};
use tracing::info;

use crate::error::{AgentError, AgentResult};

const HOST_ID_KEY: &str = "hostID";
const STAGE_KEY: &str = "stage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineId {
    pub host_id: HostId,
    pub stage: Stage,
}

fn parse(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

impl MachineId {
    /// Read `path`, filling and persisting whatever is missing.
    ///
    /// `env_stage` is the value of `ENV`, consulted only when the file has no
    /// stage.
    pub fn load_or_init(path: &Path, env_stage: Option<&str>) -> AgentResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(AgentError::io(path, e)),
        };
        let mut fields = parse(&content);
        let mut dirty = false;

        let host_id = match fields.get(HOST_ID_KEY).filter(|v| !v.is_empty()) {
            Some(id) => id.clone(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                info!(host_id = %id, path = %path.display(), "generated host id");
                fields.insert(HOST_ID_KEY.to_string(), id.clone());
                dirty = true;
                id
            }
        };

        let stage = match fields.get(STAGE_KEY).filter(|v| !v.is_empty()) {
            Some(stage) => stage
                .parse()
                .map_err(|e| AgentError::MachineId(format!("{}: {e}", path.display())))?,
            None => {
                let raw = env_stage.filter(|s| !s.trim().is_empty()).ok_or_else(|| {
                    AgentError::MachineId(format!(
                        "{} has no stage and ENV is not set",
                        path.display()
                    ))
                })?;
                let stage: Stage = raw
                    .parse()
                    .map_err(|e| AgentError::MachineId(format!("ENV: {e}")))?;
                fields.insert(STAGE_KEY.to_string(), stage.to_string());
                dirty = true;
                stage
            }
        };

        if dirty {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).map_err(|e| AgentError::io(dir, e))?;
            }
            let body: String = fields.iter().map(|(k, v)| format!("{k}={v}\n")).collect();
            std::fs::write(path, body).map_err(|e| AgentError::io(path, e))?;
        }
        Ok(Self { host_id, stage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/machine-id");

        let first = MachineId::load_or_init(&path, Some("INT")).unwrap();
        assert_eq!(first.stage, Stage::Int);
        assert!(uuid::Uuid::parse_str(&first.host_id).is_ok());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&format!("hostID={}", first.host_id)));
        assert!(content.contains("stage=int"));

        // ENV is ignored once the file carries a stage
        let again = MachineId::load_or_init(&path, Some("prd")).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn keeps_existing_and_unknown_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-id");
        std::fs::write(&path, "hostID=abc\nrack=r12\n").unwrap();

        let id = MachineId::load_or_init(&path, Some("dev")).unwrap();
        assert_eq!(id.host_id, "abc");
        assert_eq!(id.stage, Stage::Dev);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("rack=r12"));
    }

    #[test]
    fn missing_stage_without_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-id");
        std::fs::write(&path, "hostID=abc\n").unwrap();
        assert!(matches!(
            MachineId::load_or_init(&path, None),
            Err(AgentError::MachineId(_))
        ));
        assert!(MachineId::load_or_init(&path, Some("moon")).is_err());
    }
}
