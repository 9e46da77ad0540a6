//! fleet-core — shared domain model for the fleet deployment controller.
//!
//! Everything in the control plane speaks in terms of these types:
//!
//! ```text
//!   DeployConfig ──(controller)──▶ DeploySpec per host ──(agent)──▶ Instance
//!        │                              │                              │
//!   deploy/config/{type}/{name}   deploy/expect/{host}/…      deploy/actual/{host}/…/{id}
//! ```
//!
//! The [`KeySpace`] builds every store path; [`Selector`] is the structured
//! label-selector AST used both for host placement and store predicates.

pub mod config;
pub mod defaults;
pub mod deploy;
pub mod error;
pub mod instance;
pub mod keyspace;
pub mod resource;
pub mod selector;
pub mod spec;
pub mod types;

pub use config::FleetConfig;
pub use defaults::{DefaultResources, ResourceTier};
pub use deploy::*;
pub use error::{CoreError, CoreResult, MultiError};
pub use instance::*;
pub use keyspace::KeySpace;
pub use resource::*;
pub use selector::{Requirement, Selector};
pub use spec::{DeploySpec, VersionSpec};
pub use types::*;
