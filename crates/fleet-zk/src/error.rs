//! ZooKeeper mirror errors.

use std::time::Duration;

use fleet_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZkError {
    #[error("cannot reach zookeeper at {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("zookeeper operation on {path} failed: {reason}")]
    Op { path: String, reason: String },

    #[error("zookeeper session lost")]
    SessionLost,

    #[error("invalid allow pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Terminal: the supervised task kept failing.
    #[error("{name} restarted {restarts} times within {window:?}")]
    RestartStorm {
        name: String,
        restarts: usize,
        window: Duration,
    },
}

pub type ZkResult<T> = Result<T, ZkError>;
