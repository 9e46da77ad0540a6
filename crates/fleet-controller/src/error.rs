//! Controller error types.

use std::time::Duration;

use fleet_core::{CoreError, DeployKey, HostId, MultiError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("state store error: {0}")]
    Store(#[from] fleet_store::StoreError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] fleet_placement::SchedulerError),

    #[error("too many deployments in flight (limit {0})")]
    ConcurrencyFull(usize),

    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error("deploy config {0} not found")]
    ConfigNotFound(DeployKey),

    #[error("instance of {key} on {host} not up within {timeout:?}")]
    InstanceNotUp {
        key: DeployKey,
        host: HostId,
        timeout: Duration,
    },

    #[error("{0}")]
    Divergence(String),

    #[error("reconciliation cancelled")]
    Cancelled,

    #[error(transparent)]
    Multi(#[from] MultiError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
