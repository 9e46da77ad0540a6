//! fleet-agent — runs on every host.
//!
//! ```text
//!   /proc ──▶ Scanner ──AgentEvent──▶ InstanceReporter ──▶ deploy/actual/{host}/…
//!               │  watchers                 ▲ running(key)
//!               └──MetricPoint──▶ log sink  │
//!   deploy/expect/{host}/… ──▶ Converger ───┴──▶ ctrl script (start / stop)
//!   sysinfo ──▶ HostReporter ──▶ hosts/info/{host}, hosts/stat/{host} (leased)
//! ```
//!
//! The agent never forks services itself: starting and stopping goes
//! through the operator's control script, and whatever the script launches
//! is picked up by the scanner like any other process.

pub mod agent;
pub mod converge;
pub mod ctrl;
pub mod error;
pub mod handler;
pub mod hostid;
pub mod identify;
pub mod metrics;
pub mod ports;
pub mod probe;
pub mod proc;
pub mod ratio;
pub mod reporter;
pub mod scanner;

pub use agent::Agent;
pub use converge::{Converged, Converger};
pub use ctrl::{CtrlOp, CtrlScript};
pub use error::{AgentError, AgentResult};
pub use handler::{HostContext, JavaHandler, ProbeCall, ProbeOutcome, ProjectHandler, RedisHandler};
pub use hostid::MachineId;
pub use identify::{Identifier, TypeRegistry};
pub use metrics::{FieldValue, MetricPoint};
pub use proc::{ProcInfo, ProcReader};
pub use ratio::FailureRatio;
pub use reporter::{HostReporter, InstanceReporter};
pub use scanner::{AgentEvent, AgentEventKind, RequiredResources, Scanner, SysinfoSampler, UsageSampler};
