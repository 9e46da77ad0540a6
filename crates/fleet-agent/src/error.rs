//! Agent error types.

use std::path::PathBuf;

use fleet_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("machine id: {0}")]
    MachineId(String),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("cannot parse process {pid}: {reason}")]
    Process { pid: i32, reason: String },

    #[error("ctrl {op} {key} failed (exit {code:?}): {output}")]
    Ctrl {
        op: String,
        key: String,
        code: Option<i32>,
        output: String,
    },
}

impl AgentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
