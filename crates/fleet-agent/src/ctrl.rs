//! Operator control script.
//!
//! The agent never starts or stops processes itself; it runs
//! `ctrl <op> <type> <name> <pid>` and lets the script do the work. Extra
//! context travels in the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_core::DeployKey;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{AgentError, AgentResult};

pub const CTRL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlOp {
    Start,
    Stop,
    Restart,
}

impl CtrlOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CtrlOp::Start => "start",
            CtrlOp::Stop => "stop",
            CtrlOp::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CtrlScript {
    path: PathBuf,
    timeout: Duration,
}

impl CtrlScript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: CTRL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the script and return its combined output.
    ///
    /// `pid` is 0 for starts.
    pub async fn run(
        &self,
        op: CtrlOp,
        key: &DeployKey,
        pid: i32,
        env: &[(String, String)],
    ) -> AgentResult<String> {
        let fail = |code: Option<i32>, output: String| AgentError::Ctrl {
            op: op.as_str().to_string(),
            key: key.to_string(),
            code,
            output,
        };

        debug!(script = %self.path.display(), op = op.as_str(), deploy = %key, pid, "running ctrl script");
        let child = Command::new(&self.path)
            .arg(op.as_str())
            .arg(key.project_type.as_str())
            .arg(&key.name)
            .arg(pid.to_string())
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(fail(None, format!("spawn {}: {e}", self.path.display()))),
            Err(_) => return Err(fail(None, format!("timed out after {:?}", self.timeout))),
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim_end().to_string();
        if !output.status.success() {
            return Err(fail(output.status.code(), text));
        }
        info!(op = op.as_str(), deploy = %key, pid, "ctrl script succeeded");
        Ok(text)
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// A script that appends its arguments and `_version` to `log` and
    /// exits with `code`.
    pub fn script(dir: &Path, log: &Path, code: i32) -> PathBuf {
        let path = dir.join("ctrl.sh");
        let body = format!(
            "#!/bin/sh\necho \"$1 $2 $3 $4 ${{_version}}\" >> {}\necho done\nexit {code}\n",
            log.display()
        );
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_arguments_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let ctrl = CtrlScript::new(fixture::script(dir.path(), &log, 0));
        let key = DeployKey::new("java", "foo:bar");

        let out = ctrl
            .run(CtrlOp::Stop, &key, 42, &[("_version".into(), "v3".into())])
            .await
            .unwrap();
        assert_eq!(out, "done");
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.trim(), "stop java foo:bar 42 v3");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let ctrl = CtrlScript::new(fixture::script(dir.path(), &log, 3));
        let err = ctrl
            .run(CtrlOp::Start, &DeployKey::new("redis", "cache"), 0, &[])
            .await
            .unwrap_err();
        match err {
            AgentError::Ctrl { op, code, output, .. } => {
                assert_eq!(op, "start");
                assert_eq!(code, Some(3));
                assert_eq!(output, "done");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn missing_script() {
        let ctrl = CtrlScript::new("/nonexistent/ctrl.sh");
        let err = ctrl
            .run(CtrlOp::Restart, &DeployKey::new("redis", "cache"), 1, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Ctrl { code: None, .. }));
    }
}
