//! fleet-controller — the control plane's reconciliation side.
//!
//! ```text
//!   deploy/config/ ──▶ DeployConfigManager ──ConfigChange──▶ ControllerManager
//!                                                                 │ one per key
//!                                                         ReplicaController
//!                                          ┌──────────────────────┼────────────────┐
//!                                   InstanceInfor          HostConfigManager     Scheduler
//!                                  (deploy/actual/)        (deploy/expect/)    (hosts/…)
//! ```
//!
//! Controllers only ever write `deploy/expect/`; agents turn those specs
//! into processes and report back under `deploy/actual/`.

pub mod admin;
pub mod context;
pub mod deploy_config;
pub mod error;
pub mod host_config;
pub mod infor;
pub mod manager;
pub mod phase_log;
pub mod replica;
pub mod wait;

pub use admin::DeployConfigApi;
pub use context::{ControllerContext, ControllerSettings};
pub use deploy_config::{ConfigChange, DeployConfigManager};
pub use error::{ControllerError, ControllerResult};
pub use host_config::{HostConfigManager, hc_stat};
pub use infor::InstanceInfor;
pub use manager::ControllerManager;
pub use phase_log::{Phase, PhaseEntry, PhaseLog};
pub use replica::{ReplicaController, mixed_split, remove_legacy_host_configs};
pub use wait::{WaitPolicy, wait_instance_up};
