//! Scheduler error types.

use fleet_core::HostId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("host {0} is short of resource")]
    ShortOfResource(HostId),

    /// Only co-located hosts were left; the host is still usable.
    #[error("host {0} already carries this deployment")]
    AlreadyExists(HostId),

    #[error("no host meets the condition for {0}")]
    NoHostMeetCondition(String),

    #[error("state store error: {0}")]
    Store(#[from] fleet_store::StoreError),
}

impl SchedulerError {
    /// The fallback host offered alongside an `AlreadyExists` error.
    pub fn co_located_host(&self) -> Option<&str> {
        match self {
            SchedulerError::AlreadyExists(host) => Some(host),
            _ => None,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
