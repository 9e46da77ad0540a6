//! fleet-placement — picks hosts for new replicas of one deployment.
//!
//! A [`Scheduler`] is built per reconciliation pass. It lists candidate hosts
//! once, then hands them out one call at a time:
//!
//! ```text
//!   hosts/info ──selector──▶ candidates ──random pick──▶ fit check ──▶ host
//!                                         (≤ 50 tries)    free = capacity
//!                                                              − reserved
//!                                                              − used
//! ```
//!
//! Hosts that already carry the deployment are only handed out as a last
//! resort, through [`SchedulerError::AlreadyExists`].

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::Scheduler;
