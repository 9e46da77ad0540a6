//! fleet-registry — routing and probe configuration kept next to services.
//!
//! Route tables live in ZooKeeper as text in one of two dialects and are
//! mirrored into the store verbatim; [`route`] parses and emits both.
//! [`probe_iface`] serves the named sample calls the agent replays against
//! java services.

pub mod error;
pub mod probe_iface;
pub mod route;

pub use error::{BadLine, RouteParseError};
pub use probe_iface::{InterfaceSource, ProbeInterface, ProbeInterfaceProvider, ProbeInterfaces};
pub use route::{Match, MatchOp, RouteConfig, RouteV2, RouteV4, RouteVersion, RuleV4};
